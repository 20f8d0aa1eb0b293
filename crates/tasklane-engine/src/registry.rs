//! Handler registry: maps task names to handler implementations.
//!
//! Handlers are either objects implementing [`TaskHandler`] or plain async
//! closures registered with [`HandlerRegistry::register_fn`]. Registration
//! is safe at any time; lookups run under a read lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use tasklane_core::models::Task;
use tasklane_core::{HandlerError, Payload};

use crate::context::TaskContext;

/// A task handler. Invoked on arbitrary workers; implementations must be
/// thread-safe and should poll `ctx.is_cancelled()` at natural suspension
/// points.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task name this handler serves (e.g. `email.send`).
    fn name(&self) -> &str;

    async fn execute(&self, task: Task, ctx: Arc<TaskContext>) -> Result<Payload, HandlerError>;
}

struct FnHandler<F> {
    name: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, Arc<TaskContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: Task, ctx: Arc<TaskContext>) -> Result<Payload, HandlerError> {
        (self.handler)(task, ctx).await
    }
}

/// Thread-safe task-name → handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object under its own name, replacing any
    /// previous registration.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        let mut handlers = self.handlers.write().expect("handler lock poisoned");
        if handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(handler = %name, "Handler replaced");
        } else {
            tracing::debug!(handler = %name, "Handler registered");
        }
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Task, Arc<TaskContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        self.register(Arc::new(FnHandler {
            name: name.into(),
            handler,
        }));
    }

    /// Remove a handler. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::atomic::AtomicBool;
    use tasklane_core::models::TaskBuilder;

    fn test_context(task: &Task) -> Arc<TaskContext> {
        Arc::new(TaskContext::new(
            task.clone(),
            1,
            Arc::new(AtomicBool::new(false)),
            Arc::new(MemoryBackend::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn test_register_fn_and_execute() {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |task: Task, _ctx| async move { Ok(task.payload) });

        let task = TaskBuilder::new("echo")
            .payload(Payload::new().with("msg", "hi"))
            .build()
            .unwrap();
        let ctx = test_context(&task);
        let handler = registry.get("echo").unwrap();
        let result = handler.execute(task, ctx).await.unwrap();
        assert_eq!(result.get_str("msg"), Some("hi"));
    }

    #[tokio::test]
    async fn test_register_object_handler() {
        struct Doubler;

        #[async_trait]
        impl TaskHandler for Doubler {
            fn name(&self) -> &str {
                "math.double"
            }

            async fn execute(
                &self,
                task: Task,
                _ctx: Arc<TaskContext>,
            ) -> Result<Payload, HandlerError> {
                let n = task.payload.get_i64("n").unwrap_or(0);
                Ok(Payload::new().with("n", n * 2))
            }
        }

        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Doubler));
        assert!(registry.contains("math.double"));

        let task = TaskBuilder::new("math.double")
            .payload(Payload::new().with("n", 21_i64))
            .build()
            .unwrap();
        let ctx = test_context(&task);
        let result = registry
            .get("math.double")
            .unwrap()
            .execute(task, ctx)
            .await
            .unwrap();
        assert_eq!(result.get_i64("n"), Some(42));
    }

    #[test]
    fn test_lookup_missing_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register_fn("temp", |_task, _ctx| async { Ok(Payload::new()) });
        assert!(registry.unregister("temp"));
        assert!(!registry.unregister("temp"));
    }

    #[test]
    fn test_names() {
        let registry = HandlerRegistry::new();
        registry.register_fn("a", |_task, _ctx| async { Ok(Payload::new()) });
        registry.register_fn("b", |_task, _ctx| async { Ok(Payload::new()) });
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = HandlerRegistry::new();
        registry.register_fn("job", |_task, _ctx| async { Ok(Payload::new()) });
        registry.register_fn("job", |_task, _ctx| async {
            Ok(Payload::new().with("v", 2_i64))
        });
        assert_eq!(registry.names().len(), 1);
    }
}
