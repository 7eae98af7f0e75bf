//! Streaming CSV ingestion
//!
//! Files are read straight from the object store through `csv-async`; no call
//! holds more than the requested batch in memory. Header names and cell values are
//! trimmed. Each row becomes a JSON object keyed by header name.

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::ImportResult;
use crate::storage::{ObjectReader, ObjectStore};

/// One parsed row, header name to cell value
pub type CsvRow = Map<String, Value>;

/// Rows read by [`CsvIngestor::load_batch`] along with the request that asked for them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvBatch {
    pub attributes: Value,
    pub items: Vec<CsvRow>,
    /// Offset to continue from, absent once the file is exhausted
    pub next_offset: Option<usize>,
}

/// Row-at-a-time reader over a CSV stream
pub struct CsvRowReader {
    csv: AsyncReader<ObjectReader>,
    headers: Vec<String>,
    record: StringRecord,
}

impl CsvRowReader {
    pub async fn new(reader: ObjectReader) -> ImportResult<Self> {
        let mut csv = AsyncReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .create_reader(reader);

        let headers = csv.headers().await?.iter().map(str::to_string).collect();

        Ok(Self {
            csv,
            headers,
            record: StringRecord::new(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Advance past one row without materializing it. `false` at end of stream.
    pub async fn skip_row(&mut self) -> ImportResult<bool> {
        Ok(self.csv.read_record(&mut self.record).await?)
    }

    pub async fn next_row(&mut self) -> ImportResult<Option<CsvRow>> {
        if !self.skip_row().await? {
            return Ok(None);
        }

        let row = self
            .headers
            .iter()
            .zip(self.record.iter())
            .map(|(header, value)| (header.clone(), Value::String(value.to_string())))
            .collect();

        Ok(Some(row))
    }
}

#[derive(Clone)]
pub struct CsvIngestor {
    objects: Arc<dyn ObjectStore>,
}

impl CsvIngestor {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    pub async fn open(&self, key: &str) -> ImportResult<CsvRowReader> {
        CsvRowReader::new(self.objects.open_read(key).await?).await
    }

    /// Up to `limit` rows starting after `offset` data rows.
    ///
    /// Reading stops as soon as `limit` rows are collected and the object stream is
    /// dropped, closing the transfer early.
    #[instrument(skip(self, attributes))]
    pub async fn load_batch(
        &self,
        key: &str,
        attributes: Value,
        offset: usize,
        limit: usize,
    ) -> ImportResult<CsvBatch> {
        let mut items = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(CsvBatch {
                attributes,
                items,
                next_offset: Some(offset),
            });
        }

        let mut reader = self.open(key).await?;

        for _ in 0..offset {
            if !reader.skip_row().await? {
                break;
            }
        }

        while items.len() < limit {
            match reader.next_row().await? {
                Some(row) => items.push(row),
                None => break,
            }
        }
        let full = items.len() == limit;
        drop(reader);

        debug!(rows = items.len(), full, "Loaded CSV batch");

        Ok(CsvBatch {
            attributes,
            next_offset: full.then_some(offset + items.len()),
            items,
        })
    }

    /// Full streaming pass counting data rows
    #[instrument(skip(self))]
    pub async fn count_rows(&self, key: &str) -> ImportResult<u64> {
        let mut reader = self.open(key).await?;
        let mut count = 0;
        while reader.skip_row().await? {
            count += 1;
        }

        debug!(rows = count, "Counted CSV rows");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryObjectStore;
    use serde_json::json;

    fn ingestor_with(key: &str, body: &str) -> CsvIngestor {
        let store = MemoryObjectStore::new("imports");
        store.insert(key, body);
        CsvIngestor::new(Arc::new(store))
    }

    const WIDGETS: &str = " sku , name \nw-1, Sprocket \nw-2,Flange\nw-3,Gear\n";

    #[tokio::test]
    async fn test_trims_headers_and_values() {
        let ingestor = ingestor_with("w.csv", WIDGETS);
        let batch = ingestor.load_batch("w.csv", json!({}), 0, 10).await.unwrap();

        assert_eq!(batch.items.len(), 3);
        assert_eq!(Value::Object(batch.items[0].clone()), json!({"sku": "w-1", "name": "Sprocket"}));
        assert_eq!(batch.next_offset, None);
    }

    #[tokio::test]
    async fn test_limit_stops_early_in_order() {
        let ingestor = ingestor_with("w.csv", WIDGETS);
        let batch = ingestor
            .load_batch("w.csv", json!({"tableName": "widgets"}), 0, 2)
            .await
            .unwrap();

        let skus: Vec<_> = batch.items.iter().map(|r| r["sku"].clone()).collect();
        assert_eq!(skus, vec![json!("w-1"), json!("w-2")]);
        assert_eq!(batch.attributes, json!({"tableName": "widgets"}));
        assert_eq!(batch.next_offset, Some(2));

        let rest = ingestor.load_batch("w.csv", json!({}), 2, 2).await.unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0]["sku"], "w-3");
        assert_eq!(rest.next_offset, None);
    }

    #[tokio::test]
    async fn test_exact_limit_resolves() {
        let ingestor = ingestor_with("w.csv", WIDGETS);
        let batch = ingestor.load_batch("w.csv", json!({}), 0, 3).await.unwrap();
        assert_eq!(batch.items.len(), 3);

        let after = ingestor.load_batch("w.csv", json!({}), 3, 3).await.unwrap();
        assert!(after.items.is_empty());
        assert_eq!(after.next_offset, None);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let ingestor = ingestor_with("empty.csv", "");
        assert_eq!(ingestor.count_rows("empty.csv").await.unwrap(), 0);
        let batch = ingestor.load_batch("empty.csv", json!({}), 0, 10).await.unwrap();
        assert!(batch.items.is_empty());

        let ingestor = ingestor_with("header.csv", "sku,name\n");
        assert_eq!(ingestor.count_rows("header.csv").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_rows() {
        let ingestor = ingestor_with("w.csv", WIDGETS);
        assert_eq!(ingestor.count_rows("w.csv").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_short_rows_keep_present_cells() {
        let ingestor = ingestor_with("s.csv", "sku,name,colour\nw-1,Sprocket\n");
        let batch = ingestor.load_batch("s.csv", json!({}), 0, 10).await.unwrap();
        assert_eq!(Value::Object(batch.items[0].clone()), json!({"sku": "w-1", "name": "Sprocket"}));
    }

    #[tokio::test]
    async fn test_missing_object_is_an_error() {
        let ingestor = ingestor_with("w.csv", WIDGETS);
        assert!(ingestor.count_rows("nope.csv").await.is_err());
    }
}
