//! Worker runtime: the cooperative polling loop every agent runs
//!
//! A [`WorkerAgent`] registers itself, heartbeats in the background, and
//! repeatedly claims an item it has a handler for, runs the handler and
//! completes the item. It never blocks on another agent: an empty queue or a
//! lost race is followed by a sleep of `claim_poll_interval`.

use crate::coordinator::Coordinator;
use async_trait::async_trait;
use ensemble_coord_core::clarification::ClarificationOutcome;
use ensemble_coord_core::work_item::{WorkItem, WorkOutcome};
use ensemble_coord_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes work items of one type
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// The work type this handler accepts
    fn work_type(&self) -> &str;

    /// Run the item. An `Err` completes the item as failed.
    async fn handle(&self, ctx: &WorkContext, item: &WorkItem) -> Result<WorkOutcome>;
}

/// Handlers by work type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WorkHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register<H: WorkHandler + 'static>(&mut self, handler: H) {
        let work_type = handler.work_type().to_string();
        self.handlers.insert(work_type, Arc::new(handler));
    }

    pub fn get(&self, work_type: &str) -> Option<Arc<dyn WorkHandler>> {
        self.handlers.get(work_type).cloned()
    }

    pub fn supports(&self, work_type: &str) -> bool {
        self.handlers.contains_key(work_type)
    }

    /// Registered work types, sorted
    pub fn work_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("work_types", &self.work_types())
            .finish()
    }
}

/// What a handler can do while running an item
#[derive(Debug, Clone)]
pub struct WorkContext {
    agent_id: String,
    coordinator: Coordinator,
}

impl WorkContext {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Ask a human and wait at most `timeout`
    pub async fn ask(
        &self,
        question: &str,
        context: &str,
        timeout: Duration,
    ) -> Result<ClarificationOutcome> {
        self.coordinator
            .clarifications()
            .ask(&self.agent_id, question, context, timeout)
            .await
    }

    /// Append a progress note to the broadcast log
    pub async fn broadcast(&self, message: &str) {
        self.coordinator.broadcast().record(&self.agent_id, message).await;
    }
}

/// Totals for one worker run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Items the worker lost to recovery before it could complete them
    pub lost: usize,
}

/// A single agent's polling loop
#[derive(Debug)]
pub struct WorkerAgent {
    agent_id: String,
    coordinator: Coordinator,
    handlers: Arc<HandlerRegistry>,
    sweeping: bool,
    current_task: Arc<Mutex<Option<String>>>,
    declared_dead: Arc<AtomicBool>,
}

impl WorkerAgent {
    /// Worker running under `agent_id`.
    ///
    /// An agent id names one session: a clean [`run`](Self::run) retires it,
    /// and a retired or dead id can never register again. Restarting a
    /// worker needs a fresh id, see [`for_session`](Self::for_session).
    pub fn new<S: Into<String>>(agent_id: S, coordinator: Coordinator, handlers: HandlerRegistry) -> Self {
        Self {
            agent_id: agent_id.into(),
            coordinator,
            handlers: Arc::new(handlers),
            sweeping: false,
            current_task: Arc::new(Mutex::new(None)),
            declared_dead: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Worker with a fresh session id derived from `base`, such as
    /// `builder-3f9a1c2e`
    pub fn for_session(base: &str, coordinator: Coordinator, handlers: HandlerRegistry) -> Self {
        let session = Uuid::new_v4().simple().to_string();
        Self::new(format!("{}-{}", base, &session[..8]), coordinator, handlers)
    }

    /// Also run heartbeat sweeps from this agent
    pub fn with_sweeping(mut self, sweeping: bool) -> Self {
        self.sweeping = sweeping;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Claim and process at most one item. `Ok(None)` when nothing was
    /// claimable.
    pub async fn run_once(&self) -> Result<Option<WorkItem>> {
        let handlers = self.handlers.clone();
        let Some(item) = self
            .coordinator
            .work()
            .claim_where(&self.agent_id, |item| handlers.supports(&item.work_type))
            .await?
        else {
            return Ok(None);
        };

        *self.current_task.lock() = Some(item.id.clone());
        let result = self.process(&item).await;
        *self.current_task.lock() = None;
        result.map(Some)
    }

    async fn process(&self, item: &WorkItem) -> Result<WorkItem> {
        let handler = self
            .handlers
            .get(&item.work_type)
            .ok_or_else(|| Error::validation(format!("No handler for work type {}", item.work_type)))?;
        let ctx = WorkContext {
            agent_id: self.agent_id.clone(),
            coordinator: self.coordinator.clone(),
        };

        debug!(item_id = %item.id, agent_id = %self.agent_id, "Processing work item");
        let outcome = match handler.handle(&ctx, item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    item_id = %item.id,
                    agent_id = %self.agent_id,
                    error = %e,
                    "Handler failed"
                );
                WorkOutcome::Failed
            }
        };

        self.coordinator
            .work()
            .complete(&self.agent_id, &item.id, outcome)
            .await
    }

    /// Register, then poll until `shutdown` turns true or this agent is
    /// declared dead
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerSummary> {
        self.coordinator.registry().register(&self.agent_id).await?;
        info!(
            agent_id = %self.agent_id,
            work_types = ?self.handlers.work_types(),
            "Worker started"
        );

        let heartbeat = self.spawn_heartbeat();
        let sweeper = self.sweeping.then(|| {
            let monitor = self.coordinator.heartbeat_monitor(self.agent_id.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        });

        let poll_interval = self.coordinator.settings().claim_poll_interval();
        let mut summary = WorkerSummary::default();

        while !*shutdown.borrow() && !self.declared_dead.load(Ordering::SeqCst) {
            let idle = match self.run_once().await {
                Ok(Some(item)) => {
                    match item.result {
                        Some(WorkOutcome::Success) => summary.succeeded += 1,
                        _ => summary.failed += 1,
                    }
                    false
                }
                Ok(None) => true,
                Err(e @ Error::NotOwner { .. }) => {
                    warn!(agent_id = %self.agent_id, "Lost claimed item to recovery: {}", e);
                    summary.lost += 1;
                    false
                }
                Err(e) => {
                    warn!(agent_id = %self.agent_id, error = %e, "Worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        heartbeat.abort();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        if self.declared_dead.load(Ordering::SeqCst) {
            return Err(Error::state_transition(format!(
                "Agent {} was declared dead",
                self.agent_id
            )));
        }

        self.retire().await;
        info!(
            agent_id = %self.agent_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            lost = summary.lost,
            "Worker stopped"
        );
        Ok(summary)
    }

    /// Mark this session's record dead so sweepers stop tracking it
    async fn retire(&self) {
        match self
            .coordinator
            .registry()
            .mark_dead(&self.agent_id, &self.agent_id)
            .await
        {
            Ok(_) => {
                self.coordinator
                    .broadcast()
                    .record(&self.agent_id, "Retired after clean shutdown")
                    .await;
            }
            Err(e) => warn!(agent_id = %self.agent_id, "Failed to retire agent record: {}", e),
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = self.coordinator.registry().clone();
        let agent_id = self.agent_id.clone();
        let current_task = self.current_task.clone();
        let declared_dead = self.declared_dead.clone();
        let interval = self.coordinator.settings().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let task = current_task.lock().clone();
                match registry.heartbeat(&agent_id, task).await {
                    Ok(_) => {}
                    Err(Error::StateTransition { message }) => {
                        error!(agent_id = %agent_id, "Stopping: {}", message);
                        declared_dead.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(agent_id = %agent_id, "Heartbeat failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_coord_core::agent::AgentStatus;
    use ensemble_coord_core::config::CoordinationSettings;
    use ensemble_coord_core::work_item::{NewWorkItem, WorkItemStatus};
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        work_type: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl WorkHandler for CountingHandler {
        fn work_type(&self) -> &str {
            &self.work_type
        }

        async fn handle(&self, ctx: &WorkContext, item: &WorkItem) -> Result<WorkOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.broadcast(&format!("handling {}", item.id)).await;
            if self.fail {
                Err(Error::validation("boom"))
            } else {
                Ok(WorkOutcome::Success)
            }
        }
    }

    fn handlers(work_type: &str, fail: bool) -> (HandlerRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(CountingHandler {
            work_type: work_type.to_string(),
            calls: calls.clone(),
            fail,
        });
        (registry, calls)
    }

    fn fast_settings() -> CoordinationSettings {
        CoordinationSettings::builder()
            .claim_poll_interval_ms(10)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_once_processes_supported_items_only() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        coordinator
            .work()
            .enqueue(NewWorkItem::new("deploy", "producer").id("d").priority(1))
            .await
            .unwrap();
        coordinator
            .work()
            .enqueue(NewWorkItem::new("build", "producer").id("b").priority(2))
            .await
            .unwrap();

        let (registry, calls) = handlers("build", false);
        let worker = WorkerAgent::new("worker-1", coordinator.clone(), registry);

        let done = worker.run_once().await.unwrap().unwrap();
        assert_eq!(done.id, "b");
        assert_eq!(done.status, WorkItemStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(worker.run_once().await.unwrap().is_none());
        assert_eq!(coordinator.work().list_pending().await.unwrap()[0].id, "d");
    }

    #[tokio::test]
    async fn test_handler_error_completes_as_failed() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        coordinator
            .work()
            .enqueue(NewWorkItem::new("build", "producer").id("b"))
            .await
            .unwrap();

        let (registry, _calls) = handlers("build", true);
        let worker = WorkerAgent::new("worker-1", coordinator, registry);

        let done = worker.run_once().await.unwrap().unwrap();
        assert_eq!(done.result, Some(WorkOutcome::Failed));
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        for i in 0..5 {
            coordinator
                .work()
                .enqueue(NewWorkItem::new("build", "producer").id(format!("job-{}", i)))
                .await
                .unwrap();
        }

        let (registry, calls) = handlers("build", false);
        let worker = WorkerAgent::new("worker-1", coordinator.clone(), registry).with_sweeping(true);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..500 {
            if coordinator.work().stats().await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_clean_shutdown_retires_the_session() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        let (registry, _calls) = handlers("build", false);
        let worker = WorkerAgent::new("worker-1", coordinator.clone(), registry);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..500 {
            if coordinator.registry().get("worker-1").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let record = coordinator.registry().get("worker-1").await.unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Dead);
        assert!(coordinator.registry().stale_agents().await.unwrap().is_empty());
        assert!(coordinator.registry().register("worker-1").await.is_err());
    }

    #[tokio::test]
    async fn test_session_ids_are_fresh_per_worker() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        let first = WorkerAgent::for_session("builder", coordinator.clone(), HandlerRegistry::new());
        let second = WorkerAgent::for_session("builder", coordinator.clone(), HandlerRegistry::new());

        assert!(first.agent_id().starts_with("builder-"));
        assert!(second.agent_id().starts_with("builder-"));
        assert_ne!(first.agent_id(), second.agent_id());

        coordinator.registry().register(first.agent_id()).await.unwrap();
        coordinator
            .registry()
            .mark_dead(first.agent_id(), first.agent_id())
            .await
            .unwrap();
        coordinator.registry().register(second.agent_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_agent_stops() {
        let coordinator = Coordinator::in_memory(fast_settings()).unwrap();
        let (registry, _calls) = handlers("build", false);
        let worker = WorkerAgent::new("worker-1", coordinator.clone(), registry);
        coordinator.registry().register("worker-1").await.unwrap();
        coordinator
            .registry()
            .mark_dead("worker-1", "sweeper")
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition { .. }));
    }
}
