//! Webhook sink.
//!
//! Posts every change to `<base_url>/api/webhook`:
//!
//! ```json
//! { "data": {..}, "tableName": "users", "schemaId": "..", "globalId": null, "operation": "created" }
//! ```
//!
//! The receiving side answers with the record's global id, which is stored
//! in the [`MappingDb`] the first time it is seen.

use crate::error::{AdapterError, AdapterResult};
use crate::mapping_db::MappingDb;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vaultsync_sync::{Sink, SyncResult};
use vaultsync_types::{ChangeEvent, GlobalId, Operation, Record, TableName};

/// Header naming the platform a webhook call comes from.
pub const SOURCE_HEADER: &str = "X-Webhook-Source";

/// Webhook sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSinkConfig {
    /// Base URL of the receiving service.
    pub base_url: String,
    /// Sent in the `X-Webhook-Source` header.
    pub platform: String,
    /// Request timeout (ms).
    pub timeout_ms: u64,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            platform: "vaultsync".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    data: Record,
    table_name: &'a str,
    schema_id: &'a str,
    global_id: Option<&'a str>,
    operation: Operation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReply {
    #[serde(default)]
    global_id: Option<String>,
}

/// Sink delivering changes over HTTP.
pub struct HttpSink {
    config: HttpSinkConfig,
    client: Client,
    schemas: Arc<SchemaRegistry>,
    mappings: Option<MappingDb>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig, schemas: Arc<SchemaRegistry>) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AdapterError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            schemas,
            mappings: None,
        })
    }

    /// Attaches global ids from, and records new ones into, `mappings`.
    #[must_use]
    pub fn with_mappings(mut self, mappings: MappingDb) -> Self {
        self.mappings = Some(mappings);
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/api/webhook", self.config.base_url.trim_end_matches('/'))
    }

    /// Posts one change and returns the global id the sink reported.
    pub async fn post(&self, event: &ChangeEvent) -> AdapterResult<Option<GlobalId>> {
        let mapping = self
            .schemas
            .get(&event.table_name)
            .ok_or_else(|| AdapterError::UnmappedTable(event.table_name.to_string()))?;

        let known = match &self.mappings {
            Some(db) => db.global_id(&event.entity_id, &event.table_name)?,
            None => None,
        };
        let payload = WebhookPayload {
            data: event.sink_data(),
            table_name: event.table_name.as_str(),
            schema_id: &mapping.schema_id,
            global_id: known.as_ref().map(GlobalId::as_str),
            operation: event.operation,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header(SOURCE_HEADER, &self.config.platform)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Network(format!("webhook request failed: {e}")))?;

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    table = %event.table_name,
                    entity_id = %event.entity_id,
                    status = status.as_u16(),
                    error = %e,
                    "failed to read webhook response body"
                );
                String::new()
            }
        };
        if !status.is_success() {
            return Err(AdapterError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!(
            table = %event.table_name,
            entity_id = %event.entity_id,
            status = status.as_u16(),
            "webhook accepted"
        );

        // an empty or non-JSON body is a plain acknowledgement
        let reply: WebhookReply = serde_json::from_str(&body).unwrap_or_default();
        let reported = reply.global_id.and_then(GlobalId::new);
        if let (Some(db), Some(global), None) = (&self.mappings, &reported, &known) {
            if event.operation != Operation::Removed {
                db.store_mapping(
                    event.entity_id.as_str(),
                    global.as_str(),
                    event.table_name.as_str(),
                )?;
            }
        }
        Ok(reported.or(known))
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn handle_change(&self, event: &ChangeEvent) -> SyncResult<()> {
        match self.post(event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_retryable() {
                    warn!(table = %event.table_name, error = %e, "webhook delivery failed, retryable");
                }
                Err(e.into())
            }
        }
    }

    fn accepts(&self, table: &TableName) -> bool {
        self.schemas.contains(table)
    }
}
