//! Tool call bridge: correlates remote tool requests with host handlers.
//!
//! The remote model asks for a named operation with JSON arguments and an
//! opaque `call_id`. The bridge looks the name up in the host-registered
//! table, runs the handler on its own task, and emits exactly one correlated
//! result envelope followed by a continuation request — whether the handler
//! succeeded, failed, or doesn't exist. A failing tool must never terminate
//! the session.
//!
//! Distinct `call_id`s run concurrently; the bridge imposes no ordering
//! across them and guarantees at most one result per `call_id`.

use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{ConversationItem, OutboundEnvelope, ToolSpec};

/// A host-supplied business operation callable by the remote model.
///
/// Implementations live entirely outside this crate (record lookups, finding
/// creation, ...). Errors returned here are converted into failure-shaped
/// outputs at the bridge boundary, never propagated as session faults.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    /// Declaration sent to the remote service at configure time.
    fn spec(&self) -> ToolSpec;

    /// Execute with parsed arguments, returning the JSON result.
    async fn call(&self, arguments: Value) -> Result<Value>;
}

/// Name → handler table, populated by the host before `connect()`.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name. Re-registering a name
    /// replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.spec().name.clone();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(tool = %name, "replacing previously registered tool handler");
        }
    }

    /// Declarations for the `session.update` envelope.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.handlers.values().map(|h| h.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Tool call counters for observability.
#[derive(Default)]
pub struct ToolDiagnostics {
    pub calls_dispatched: AtomicUsize,
    pub calls_failed: AtomicUsize,
    pub calls_duplicate: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolDiagnosticsSnapshot {
    pub calls_dispatched: usize,
    pub calls_failed: usize,
    pub calls_duplicate: usize,
}

impl ToolDiagnostics {
    pub fn snapshot(&self) -> ToolDiagnosticsSnapshot {
        ToolDiagnosticsSnapshot {
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_duplicate: self.calls_duplicate.load(Ordering::Relaxed),
        }
    }
}

/// Executes tool requests and emits correlated results on the outbound queue.
pub struct ToolBridge {
    registry: ToolRegistry,
    outbound: mpsc::Sender<OutboundEnvelope>,
    /// Every `call_id` ever dispatched this session. Never pruned, so a
    /// replayed id can never produce a second result.
    seen: Arc<Mutex<HashSet<String>>>,
    diagnostics: Arc<ToolDiagnostics>,
}

impl ToolBridge {
    pub fn new(registry: ToolRegistry, outbound: mpsc::Sender<OutboundEnvelope>) -> Self {
        Self {
            registry,
            outbound,
            seen: Arc::new(Mutex::new(HashSet::new())),
            diagnostics: Arc::new(ToolDiagnostics::default()),
        }
    }

    /// Handle one inbound tool request. Returns immediately; the handler
    /// runs on its own task so concurrently arriving audio and speech-state
    /// events are never blocked behind it.
    pub fn dispatch(&self, call_id: String, name: String, arguments: String) {
        if !self.seen.lock().insert(call_id.clone()) {
            self.diagnostics
                .calls_duplicate
                .fetch_add(1, Ordering::Relaxed);
            warn!(call_id = %call_id, "duplicate tool call id — dropped");
            return;
        }
        self.diagnostics
            .calls_dispatched
            .fetch_add(1, Ordering::Relaxed);

        let handler = self.registry.get(&name);
        let outbound = self.outbound.clone();
        let diagnostics = Arc::clone(&self.diagnostics);

        tokio::spawn(async move {
            debug!(call_id = %call_id, tool = %name, "tool call started");
            let output = run_handler(handler, &name, &arguments).await;
            if output.get("error").is_some() {
                diagnostics.calls_failed.fetch_add(1, Ordering::Relaxed);
            }

            let result = OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: call_id.clone(),
                    output: output.to_string(),
                },
            };
            if outbound.send(result).await.is_err() {
                warn!(call_id = %call_id, "outbound queue closed before tool result");
                return;
            }
            // Ask the model to resume with the result in context.
            if outbound.send(OutboundEnvelope::ResponseCreate).await.is_err() {
                warn!(call_id = %call_id, "outbound queue closed before continuation");
                return;
            }
            info!(call_id = %call_id, tool = %name, "tool call resolved");
        });
    }

    pub fn diagnostics_snapshot(&self) -> ToolDiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

/// Run a handler to a JSON output, converting every failure mode into a
/// failure-shaped value.
async fn run_handler(
    handler: Option<Arc<dyn ToolHandler>>,
    name: &str,
    arguments: &str,
) -> Value {
    let Some(handler) = handler else {
        warn!(tool = %name, "tool call for unregistered handler");
        return json!({ "error": format!("unknown tool: {name}") });
    };

    let args: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %name, "unparseable tool arguments: {e}");
            return json!({ "error": format!("invalid arguments: {e}") });
        }
    };

    match handler.call(args).await {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %name, "tool handler failed: {e}");
            json!({ "error": e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ColloquyError;
    use std::time::Duration;
    use tokio::time::timeout;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function("echo", "Echo arguments back", json!({"type": "object"}))
        }

        async fn call(&self, arguments: Value) -> Result<Value> {
            Ok(json!({ "ok": true, "echo": arguments }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolHandler for FailingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function("boom", "Always fails", json!({"type": "object"}))
        }

        async fn call(&self, _arguments: Value) -> Result<Value> {
            Err(ColloquyError::ToolExecution("backend unavailable".into()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function("slow", "Sleeps before answering", json!({"type": "object"}))
        }

        async fn call(&self, _arguments: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "ok": true }))
        }
    }

    fn bridge_with(
        handlers: Vec<Arc<dyn ToolHandler>>,
    ) -> (ToolBridge, mpsc::Receiver<OutboundEnvelope>) {
        let mut registry = ToolRegistry::new();
        for h in handlers {
            registry.register(h);
        }
        let (tx, rx) = mpsc::channel(16);
        (ToolBridge::new(registry, tx), rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<OutboundEnvelope>) -> OutboundEnvelope {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn resolves_call_with_result_then_continuation() {
        let (bridge, mut rx) = bridge_with(vec![Arc::new(EchoTool) as Arc<dyn ToolHandler>]);

        bridge.dispatch("42".into(), "echo".into(), r#"{"id":"a1"}"#.into());

        match recv(&mut rx).await {
            OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, output },
            } => {
                assert_eq!(call_id, "42");
                let parsed: Value = serde_json::from_str(&output).unwrap();
                assert_eq!(parsed["ok"], true);
                assert_eq!(parsed["echo"]["id"], "a1");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(recv(&mut rx).await, OutboundEnvelope::ResponseCreate);
    }

    #[tokio::test]
    async fn handler_failure_becomes_failure_shaped_output() {
        let (bridge, mut rx) = bridge_with(vec![Arc::new(FailingTool) as Arc<dyn ToolHandler>]);

        bridge.dispatch("7".into(), "boom".into(), "{}".into());

        match recv(&mut rx).await {
            OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, output },
            } => {
                assert_eq!(call_id, "7");
                let parsed: Value = serde_json::from_str(&output).unwrap();
                assert!(parsed["error"]
                    .as_str()
                    .unwrap()
                    .contains("backend unavailable"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        // Continuation still follows a failed call.
        assert_eq!(recv(&mut rx).await, OutboundEnvelope::ResponseCreate);
        assert_eq!(bridge.diagnostics_snapshot().calls_failed, 1);
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_without_session_fault() {
        let (bridge, mut rx) = bridge_with(vec![]);

        bridge.dispatch("9".into(), "missing".into(), "{}".into());

        match recv(&mut rx).await {
            OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, output },
            } => {
                assert_eq!(call_id, "9");
                assert!(output.contains("unknown tool"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(recv(&mut rx).await, OutboundEnvelope::ResponseCreate);
    }

    #[tokio::test]
    async fn duplicate_call_id_is_resolved_exactly_once() {
        let (bridge, mut rx) = bridge_with(vec![Arc::new(EchoTool) as Arc<dyn ToolHandler>]);

        bridge.dispatch("dup".into(), "echo".into(), "{}".into());
        bridge.dispatch("dup".into(), "echo".into(), "{}".into());

        // Exactly one result + one continuation; the second dispatch is dropped.
        let _ = recv(&mut rx).await;
        let _ = recv(&mut rx).await;
        let extra = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "duplicate call_id must not emit again");
        assert_eq!(bridge.diagnostics_snapshot().calls_duplicate, 1);
    }

    #[tokio::test]
    async fn distinct_calls_run_concurrently() {
        let (bridge, mut rx) =
            bridge_with(vec![Arc::new(SlowTool) as Arc<dyn ToolHandler>, Arc::new(EchoTool)]);

        bridge.dispatch("s1".into(), "slow".into(), "{}".into());
        bridge.dispatch("e1".into(), "echo".into(), "{}".into());

        // The fast call must not be serialized behind the slow one.
        match recv(&mut rx).await {
            OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, .. },
            } => assert_eq!(call_id, "e1"),
            other => panic!("expected fast tool result first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_arguments_fail_before_the_handler_runs() {
        let (bridge, mut rx) = bridge_with(vec![Arc::new(EchoTool) as Arc<dyn ToolHandler>]);

        bridge.dispatch("m1".into(), "echo".into(), "{broken".into());

        match recv(&mut rx).await {
            OutboundEnvelope::ItemCreate {
                item: ConversationItem::FunctionCallOutput { output, .. },
            } => assert!(output.contains("invalid arguments")),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn registry_specs_are_sorted_and_deduplicated() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(EchoTool));

        let names: Vec<_> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "slow"]);
    }
}
