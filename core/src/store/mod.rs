//! Byte-blob storage addressed by `(container, key)`.

pub mod memory;
pub mod s3;

use std::future::Future;

use bytes::Bytes;

use crate::errors::StoreError;

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

/// Result of a delimited prefix listing. Both lists are sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    /// Keys directly under the prefix.
    pub keys: Vec<String>,
    /// Child prefixes up to and including the delimiter.
    pub common_prefixes: Vec<String>,
}

pub trait ObjectStore: Send + Sync {
    fn get(&self, container: &str, key: &str)
    -> impl Future<Output = Result<Bytes, StoreError>> + Send;

    fn put(
        &self,
        container: &str,
        key: &str,
        body: Bytes,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Lists `prefix`. Without a delimiter every key below the prefix is returned
    /// and `common_prefixes` is empty.
    fn list(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> impl Future<Output = Result<Listing, StoreError>> + Send;
}
