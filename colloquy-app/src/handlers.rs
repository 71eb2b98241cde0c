//! Demo business handlers behind the `ToolHandler` seam.
//!
//! Stand-ins for the real host services (record lookups, finding creation)
//! so the engine can be exercised end-to-end without a backend. The handlers
//! share one in-memory store; a production host would register handlers
//! backed by its own data layer instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::{ToolHandler, ToolRegistry, ToolSpec};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::info;

/// Shared in-memory record store backing both demo handlers.
#[derive(Default)]
pub struct DemoStore {
    records: Mutex<HashMap<String, Value>>,
    findings: Mutex<Vec<Value>>,
}

impl DemoStore {
    pub fn with_sample_data() -> Arc<Self> {
        let store = Self::default();
        {
            let mut records = store.records.lock();
            records.insert(
                "a1".into(),
                json!({"id": "a1", "name": "North plant inspection", "status": "open"}),
            );
            records.insert(
                "b2".into(),
                json!({"id": "b2", "name": "Warehouse audit", "status": "closed"}),
            );
        }
        Arc::new(store)
    }

    pub fn findings_count(&self) -> usize {
        self.findings.lock().len()
    }
}

/// `lookup_record { id }` → the stored record, or a not-found error object.
pub struct LookupRecord {
    store: Arc<DemoStore>,
}

#[async_trait]
impl ToolHandler for LookupRecord {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "lookup_record",
            "Fetch a record by its id",
            json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Record id" }
                },
                "required": ["id"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let id = arguments
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ColloquyError::ToolExecution("missing required field: id".into()))?;

        match self.store.records.lock().get(id) {
            Some(record) => Ok(json!({"ok": true, "record": record})),
            None => Ok(json!({"ok": false, "error": format!("no record with id {id}")})),
        }
    }
}

/// `create_finding { record_id, summary }` → appends a finding.
pub struct CreateFinding {
    store: Arc<DemoStore>,
}

#[async_trait]
impl ToolHandler for CreateFinding {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "create_finding",
            "Attach a new finding to a record",
            json!({
                "type": "object",
                "properties": {
                    "record_id": { "type": "string" },
                    "summary": { "type": "string" }
                },
                "required": ["record_id", "summary"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let record_id = arguments
            .get("record_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ColloquyError::ToolExecution("missing required field: record_id".into())
            })?;
        let summary = arguments
            .get("summary")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ColloquyError::ToolExecution("missing required field: summary".into())
            })?;

        if !self.store.records.lock().contains_key(record_id) {
            return Ok(json!({"ok": false, "error": format!("no record with id {record_id}")}));
        }

        let finding = json!({"record_id": record_id, "summary": summary});
        self.store.findings.lock().push(finding.clone());
        info!(record_id, "finding created");
        Ok(json!({"ok": true, "finding": finding}))
    }
}

/// Register the demo handlers on a registry.
pub fn register_demo_handlers(registry: &mut ToolRegistry, store: Arc<DemoStore>) {
    registry.register(Arc::new(LookupRecord {
        store: Arc::clone(&store),
    }));
    registry.register(Arc::new(CreateFinding { store }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_returns_stored_record() {
        let store = DemoStore::with_sample_data();
        let handler = LookupRecord {
            store: Arc::clone(&store),
        };
        let out = handler.call(json!({"id": "a1"})).await.unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["record"]["name"], "North plant inspection");
    }

    #[tokio::test]
    async fn lookup_unknown_id_is_ok_false_not_an_error() {
        let store = DemoStore::with_sample_data();
        let handler = LookupRecord { store };
        let out = handler.call(json!({"id": "zz"})).await.unwrap();
        assert_eq!(out["ok"], false);
    }

    #[tokio::test]
    async fn lookup_without_id_fails_at_the_handler() {
        let store = DemoStore::with_sample_data();
        let handler = LookupRecord { store };
        let err = handler.call(json!({})).await.unwrap_err();
        assert!(matches!(err, ColloquyError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn create_finding_appends_to_store() {
        let store = DemoStore::with_sample_data();
        let handler = CreateFinding {
            store: Arc::clone(&store),
        };
        let out = handler
            .call(json!({"record_id": "a1", "summary": "Valve corrosion"}))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(store.findings_count(), 1);
    }

    #[test]
    fn registry_declares_both_demo_tools() {
        let mut registry = ToolRegistry::new();
        register_demo_handlers(&mut registry, DemoStore::with_sample_data());
        let names: Vec<_> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["create_finding", "lookup_record"]);
    }
}
