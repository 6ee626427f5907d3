//! Columnar encoding of record batches.

use std::io::Cursor;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::errors::CodecError;

pub trait TabularCodec: Send + Sync {
    /// Extension of the files this codec writes, including the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, batch: &RecordBatch) -> Result<Bytes, CodecError>;

    /// Decodes a whole file. `key` only labels errors.
    fn decode(&self, key: &str, bytes: Bytes) -> Result<RecordBatch, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetCodec;

impl ParquetCodec {
    fn writer_properties() -> WriterProperties {
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_created_by("marketplace-pipeline".to_string())
            .build()
    }
}

impl TabularCodec for ParquetCodec {
    fn extension(&self) -> &'static str {
        ".parquet"
    }

    fn encode(&self, batch: &RecordBatch) -> Result<Bytes, CodecError> {
        let encode_err = |e: parquet::errors::ParquetError| CodecError::Encode {
            reason: e.to_string(),
        };

        let mut cursor = Cursor::new(Vec::<u8>::new());
        let mut writer =
            ArrowWriter::try_new(&mut cursor, batch.schema(), Some(Self::writer_properties()))
                .map_err(encode_err)?;
        writer.write(batch).map_err(encode_err)?;
        writer.close().map_err(encode_err)?;
        Ok(Bytes::from(cursor.into_inner()))
    }

    fn decode(&self, key: &str, bytes: Bytes) -> Result<RecordBatch, CodecError> {
        let decode_err = |reason: String| CodecError::Decode {
            key: key.to_string(),
            reason,
        };

        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .map_err(|e| decode_err(format!("parquet reader init failed: {e}")))?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| decode_err(format!("parquet reader build failed: {e}")))?;

        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| decode_err(format!("parquet read batch failed: {e}")))?;
        concat_batches(&schema, &batches).map_err(|e| decode_err(e.to_string()))
    }
}
