//! Step and domain handlers.
//!
//! A `TaskHandler` is the unit of business logic the orchestrator schedules:
//! workflow steps resolve their `action` name to one through the
//! `ActionRegistry`, and coordinator domains carry one directly.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;

/// What a handler produces: an output value or error text.
pub type TaskOutcome = Result<Value, String>;

/// Async handler receiving a context snapshot and the run's cancellation token.
pub type TaskHandler =
    Arc<dyn Fn(Arc<WorkflowContext>, CancellationToken) -> BoxFuture<'static, TaskOutcome> + Send + Sync>;

/// Box an async closure into a `TaskHandler`.
pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(Arc<WorkflowContext>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(move |ctx: Arc<WorkflowContext>, token: CancellationToken| {
        f(ctx, token).boxed()
    })
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Named step implementations, owned by one executor.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, TaskHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any previous one with the same name.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<WorkflowContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register_handler(name, task_handler(f));
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: TaskHandler) {
        let name = name.into();
        if self.actions.insert(name.clone(), handler).is_some() {
            tracing::debug!(action = name.as_str(), "replaced registered action");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.actions.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.actions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("ActionRegistry")
            .field("actions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = ActionRegistry::new();
        registry.register("build", |ctx, _token| async move {
            Ok(json!({"workflow": ctx.workflow_id}))
        });

        assert!(registry.contains("build"));
        let handler = registry.get("build").unwrap();
        let ctx = Arc::new(WorkflowContext::new("release", "ci"));
        let out = handler(ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(out, json!({"workflow": "release"}));
    }

    #[tokio::test]
    async fn test_register_replaces_existing() {
        let registry = ActionRegistry::new();
        registry.register("a", |_, _| async { Ok(json!(1)) });
        registry.register("a", |_, _| async { Ok(json!(2)) });
        assert_eq!(registry.len(), 1);

        let handler = registry.get("a").unwrap();
        let out = handler(Arc::default(), CancellationToken::new()).await;
        assert_eq!(out, Ok(json!(2)));
    }

    #[test]
    fn test_unregister() {
        let registry = ActionRegistry::new();
        registry.register("a", |_, _| async { Ok(Value::Null) });
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "handler panicked");
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = ActionRegistry::new();
        registry.register("b", |_, _| async { Ok(Value::Null) });
        registry.register("a", |_, _| async { Ok(Value::Null) });
        let debug = format!("{registry:?}");
        assert!(debug.contains("[\"a\", \"b\"]"), "got: {debug}");
    }
}
