use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

use super::{Listing, ObjectStore};
use crate::config::StoreConfig;
use crate::errors::StoreError;

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn new(config: &StoreConfig) -> Self {
        let region = aws_config::Region::new(config.region.clone());

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest()).region(region);

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            aws_config_builder =
                aws_config_builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                    access_key,
                    secret_key,
                    config.session_token.clone(),
                    None,
                    "marketplace-pipeline",
                ));
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(config.force_path_style);

        if let Some(endpoint_url) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn unavailable(operation: &str, error: impl std::error::Error) -> StoreError {
    StoreError::Unavailable {
        operation: operation.to_string(),
        reason: DisplayErrorContext(error).to_string(),
    }
}

impl ObjectStore for S3ObjectStore {
    async fn get(&self, container: &str, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StoreError::NotFound {
                        container: container.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    unavailable("get", e)
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| unavailable("get", e))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, container: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(container)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| unavailable("put", e))?;

        debug!("Wrote {} bytes to s3://{}/{}", size, container, key);
        Ok(())
    }

    async fn list(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Listing, StoreError> {
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix)
                .set_delimiter(delimiter.map(str::to_string))
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| unavailable("list", e))?;

            listing
                .keys
                .extend(response.contents().iter().filter_map(|o| o.key()).map(str::to_string));
            listing.common_prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        listing.keys.sort();
        listing.common_prefixes.sort();
        debug!(
            "Listed s3://{}/{}: {} keys, {} prefixes",
            container,
            prefix,
            listing.keys.len(),
            listing.common_prefixes.len()
        );
        Ok(listing)
    }
}
