//! PostgREST gateway over the embedding table (Supabase and friends).
//!
//! Reads only. Rows are fetched page by page with `limit`/`offset` ordered by
//! tenant and item so pages are stable. Paging stops at the first empty page:
//! servers cap `limit` (PostgREST `db-max-rows`), so a short page says nothing
//! about whether more rows follow. The watermark is a single-row
//! `order=updated_at.desc.nullslast&limit=1` query over non-null stamps.
//!
//! Rows with a NULL `updated_at` are still indexed. They are stamped at the
//! Unix epoch and never move the watermark.
//!
//! # Configuration Example
//! ```yaml
//! store:
//!   backend: postgrest
//!   url: "https://project.supabase.co"
//!   api_key: "service-role-key"
//!   table: intent_embedding
//! ```

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::coerce::RawVector;
use crate::config::PostgrestConfig;
use crate::error::StoreError;
use crate::store::{EmbeddingRecord, EmbeddingStore};

/// Blocking PostgREST client for one embedding table.
pub struct PostgrestStore {
    client: Client,
    cfg: PostgrestConfig,
    endpoint: String,
}

impl PostgrestStore {
    pub fn new(cfg: PostgrestConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let endpoint = format!("{}/rest/v1/{}", cfg.url.trim_end_matches('/'), cfg.table);
        Ok(Self {
            client,
            cfg,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self) -> RequestBuilder {
        let mut req = self.client.get(&self.endpoint);
        if !self.cfg.api_key.is_empty() {
            req = req
                .header("apikey", &self.cfg.api_key)
                .bearer_auth(&self.cfg.api_key);
        }
        req
    }

    fn select(&self) -> String {
        format!(
            "{},{},{},{}",
            self.cfg.tenant_column,
            self.cfg.item_column,
            self.cfg.vector_column,
            self.cfg.updated_at_column
        )
    }

    fn send(req: RequestBuilder) -> Result<Vec<Value>, StoreError> {
        let resp = req.send().map_err(|e| StoreError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Vec<Value>>()
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    /// All rows matching `filter`, following pages until an empty one.
    fn fetch_rows(&self, filter: Option<(&str, String)>) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let order = format!("{}.asc,{}.asc", self.cfg.tenant_column, self.cfg.item_column);
        let page_size = self.cfg.page_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut req = self.request().query(&[
                ("select", self.select()),
                ("order", order.clone()),
                ("limit", page_size.to_string()),
                ("offset", offset.to_string()),
            ]);
            if let Some((column, value)) = &filter {
                req = req.query(&[(*column, value.as_str())]);
            }
            let page = Self::send(req)?;
            let fetched = page.len();
            for row in &page {
                out.push(self.decode_row(row)?);
            }
            debug!(endpoint = %self.endpoint, offset, fetched, "postgrest_page");
            if fetched == 0 {
                break;
            }
            offset += fetched;
        }
        Ok(out)
    }

    fn decode_row(&self, row: &Value) -> Result<EmbeddingRecord, StoreError> {
        let tenant_id = id_field(row, &self.cfg.tenant_column)?;
        let item_id = id_field(row, &self.cfg.item_column)?;
        let vector = row
            .get(&self.cfg.vector_column)
            .cloned()
            .ok_or_else(|| missing(&self.cfg.vector_column))
            .and_then(|v| {
                serde_json::from_value::<RawVector>(v).map_err(|e| {
                    StoreError::Decode(format!("{}: {e}", self.cfg.vector_column))
                })
            })?;
        let updated_at = match row.get(&self.cfg.updated_at_column) {
            Some(Value::String(raw)) => parse_timestamp(raw)?,
            Some(Value::Null) => {
                debug!(tenant_id = %tenant_id, item_id = %item_id, "postgrest_row_without_stamp");
                DateTime::<Utc>::UNIX_EPOCH
            }
            _ => return Err(missing(&self.cfg.updated_at_column)),
        };
        Ok(EmbeddingRecord {
            tenant_id,
            item_id,
            vector,
            updated_at,
        })
    }
}

impl EmbeddingStore for PostgrestStore {
    fn fetch_all_embeddings(&self) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.fetch_rows(None)
    }

    fn fetch_embeddings_for(&self, tenant_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.fetch_rows(Some((self.cfg.tenant_column.as_str(), format!("eq.{tenant_id}"))))
    }

    fn fetch_latest_watermark(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let column = &self.cfg.updated_at_column;
        let req = self.request().query(&[
            ("select", column.clone()),
            (self.cfg.tenant_column.as_str(), format!("eq.{tenant_id}")),
            (column.as_str(), "not.is.null".to_string()),
            ("order", format!("{column}.desc.nullslast")),
            ("limit", "1".to_string()),
        ]);
        let rows = Self::send(req)?;
        match rows.first().map(|row| row.get(column)) {
            None | Some(Some(Value::Null)) => Ok(None),
            Some(Some(Value::String(raw))) => parse_timestamp(raw).map(Some),
            Some(_) => Err(missing(column)),
        }
    }
}

fn missing(column: &str) -> StoreError {
    StoreError::Decode(format!("row is missing column {column}"))
}

/// Ids may be text, uuid (text on the wire) or integer columns.
fn id_field(row: &Value, column: &str) -> Result<String, StoreError> {
    match row.get(column) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(missing(column)),
    }
}

/// `timestamptz` arrives as RFC 3339; plain `timestamp` has no offset and is taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Decode(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> PostgrestStore {
        PostgrestStore::new(PostgrestConfig {
            url: "https://example.supabase.co/".into(),
            ..PostgrestConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoint_joins_url_and_table() {
        assert_eq!(
            store().endpoint(),
            "https://example.supabase.co/rest/v1/intent_embedding"
        );
    }

    #[test]
    fn decodes_pgvector_text_and_uuid_ids() {
        let row = json!({
            "client_id": "94ec6461-9466-44f2-9938-9e9a3e60ab39",
            "intent_id": 42,
            "embedding": "[0.1,0.2,0.3]",
            "updated_at": "2025-03-01T10:00:00.123456+00:00"
        });
        let rec = store().decode_row(&row).unwrap();
        assert_eq!(rec.tenant_id, "94ec6461-9466-44f2-9938-9e9a3e60ab39");
        assert_eq!(rec.item_id, "42");
        assert_eq!(rec.vector, RawVector::Text("[0.1,0.2,0.3]".into()));
        assert_eq!(rec.updated_at.timestamp(), 1_740_823_200);
    }

    #[test]
    fn decodes_json_array_vectors() {
        let row = json!({
            "client_id": "t1",
            "intent_id": "i1",
            "embedding": [[1.0, 0.0]],
            "updated_at": "2025-03-01T10:00:00"
        });
        let rec = store().decode_row(&row).unwrap();
        assert_eq!(rec.vector, RawVector::Nested(vec![vec![1.0, 0.0]]));
    }

    #[test]
    fn missing_columns_are_decode_errors() {
        let row = json!({ "client_id": "t1", "embedding": [1.0] });
        let err = store().decode_row(&row).unwrap_err();
        assert!(matches!(err, StoreError::Decode(ref m) if m.contains("intent_id")));
    }

    #[test]
    fn null_stamps_decode_at_the_epoch() {
        let row = json!({
            "client_id": "t1",
            "intent_id": "i1",
            "embedding": [1.0, 0.0],
            "updated_at": null
        });
        let rec = store().decode_row(&row).unwrap();
        assert_eq!(rec.updated_at, DateTime::<Utc>::UNIX_EPOCH);

        let row = json!({ "client_id": "t1", "intent_id": "i1", "embedding": [1.0] });
        let err = store().decode_row(&row).unwrap_err();
        assert!(matches!(err, StoreError::Decode(ref m) if m.contains("updated_at")));
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let ts = parse_timestamp("2025-03-01T10:00:00").unwrap();
        assert_eq!(ts.timestamp(), 1_740_823_200);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
