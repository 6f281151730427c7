//! Scheduler - one execution context per module
//!
//! Each module is driven by its own tokio task:
//!
//! ```text
//! initialize ─▶ run_once ─▶ (sleep re-arm delay) ─▶ run_once ─▶ ... ─▶ draining ─▶ shutdown
//!                  │
//!                  └─ error / panic / timeout ─▶ log ─▶ recover ─▶ next cycle
//! ```
//!
//! A failing module never takes down its siblings; the worst it can do is
//! keep logging and recovering. Priorities only decide the order in which
//! modules are started, they never preempt a running module.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{Cycle, Lifecycle, Module, StatusBoard};
use crate::config::SchedulerSettings;
use crate::envelope::Envelope;
use crate::error::{AgentError, AgentResult};
use crate::queue::QueueRegistry;

pub struct Scheduler {
    settings: SchedulerSettings,
    registry: Arc<QueueRegistry>,
    statuses: StatusBoard,
    modules: Vec<(Box<dyn Module>, watch::Sender<Lifecycle>)>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, registry: Arc<QueueRegistry>) -> Self {
        Self {
            settings,
            registry,
            statuses: StatusBoard::default(),
            modules: vec![],
        }
    }

    /// Board that will track every module added to this scheduler
    pub fn status_board(&self) -> StatusBoard {
        self.statuses.clone()
    }

    /// Take ownership of a module; it is `registered` until started
    pub fn add(&mut self, module: Box<dyn Module>) {
        let name = module.descriptor().name.clone();
        let (tx, rx) = watch::channel(Lifecycle::Registered);
        self.statuses.insert(&name, rx);

        debug!("registered module {name}");
        self.modules.push((module, tx));
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Spawn one task per module, lowest priority value first
    pub fn start(mut self) -> SchedulerHandle {
        self.modules
            .sort_by_key(|(module, _)| module.descriptor().priority);

        let tasks = self
            .modules
            .into_iter()
            .map(|(module, state)| {
                let name = module.descriptor().name.clone();
                let settings = self.settings.clone();
                info!("starting module {name}");
                (name, tokio::spawn(drive(module, state, settings)))
            })
            .collect();

        SchedulerHandle {
            registry: self.registry,
            statuses: self.statuses,
            tasks,
        }
    }
}

/// Run a module until it reports [`Cycle::Stopped`]
#[instrument(skip_all, fields(module = %module.descriptor().name))]
async fn drive(
    mut module: Box<dyn Module>,
    state: watch::Sender<Lifecycle>,
    settings: SchedulerSettings,
) {
    match guarded(module.initialize(), &settings).await {
        Ok(()) => debug!("initialized"),
        Err(e) => {
            error!("initialization failed: {e}");
            reinitialize(module.as_mut(), &settings).await;
        }
    }
    state.send_replace(Lifecycle::Running);

    loop {
        match guarded(module.run_once(), &settings).await {
            Ok(Cycle::Continue) => {}
            Ok(Cycle::Draining) => {
                if *state.borrow() != Lifecycle::Draining {
                    info!("draining");
                    state.send_replace(Lifecycle::Draining);
                }
            }
            Ok(Cycle::Stopped) => break,
            Err(e) => {
                error!("work cycle failed, reinitializing: {e}");
                reinitialize(module.as_mut(), &settings).await;
            }
        }

        tokio::time::sleep(settings.re_arm()).await;
    }

    if *state.borrow() != Lifecycle::Draining {
        info!("draining");
        state.send_replace(Lifecycle::Draining);
    }
    module.shutdown().await;
    state.send_replace(Lifecycle::Stopped);
    info!("stopped");
}

async fn reinitialize(module: &mut dyn Module, settings: &SchedulerSettings) {
    if let Err(e) = guarded(module.recover(), settings).await {
        warn!("recovery failed, retrying next cycle: {e}");
    }
}

/// Bound a module call by the cycle timeout and turn panics into errors
async fn guarded<T, F>(call: F, settings: &SchedulerSettings) -> AgentResult<T>
where
    F: std::future::Future<Output = AgentResult<T>>,
{
    match tokio::time::timeout(settings.cycle_timeout(), AssertUnwindSafe(call).catch_unwind())
        .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(AgentError::Cycle(format!("panicked: {reason}")))
        }
        Err(_) => Err(AgentError::Cycle(format!(
            "exceeded {:?}",
            settings.cycle_timeout()
        ))),
    }
}

/// Handle to the running modules
pub struct SchedulerHandle {
    registry: Arc<QueueRegistry>,
    statuses: StatusBoard,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl SchedulerHandle {
    /// Broadcast the shutdown notice into every inbox
    ///
    /// Returns the number of inboxes that received it.
    pub fn shutdown(&self) -> usize {
        let delivered = self.registry.broadcast(&Envelope::shutdown_notice());
        info!("shutdown notice delivered to {delivered} module(s)");
        delivered
    }

    pub fn status(&self, name: &str) -> Option<Lifecycle> {
        self.statuses.get(name)
    }

    pub fn statuses(&self) -> &StatusBoard {
        &self.statuses
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Wait for every module task to end
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("module {name} task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Body, Payload};
    use crate::modules::{ModuleDescriptor, ModuleGroup, next_batch};
    use crate::queue::Inbox;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            re_arm_millis: 5,
            cycle_timeout_secs: 1,
            receive_timeout_millis: 5,
        }
    }

    /// Counts handled envelopes, optionally panicking on its first cycle
    struct Counter {
        descriptor: ModuleDescriptor,
        inbox: Inbox,
        handled: Arc<AtomicUsize>,
        recovered: Arc<AtomicUsize>,
        panic_once: bool,
        stopping: bool,
    }

    #[async_trait]
    impl Module for Counter {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn run_once(&mut self) -> AgentResult<Cycle> {
            if self.panic_once {
                self.panic_once = false;
                panic!("boom");
            }

            let batch = next_batch(&mut self.inbox, Duration::from_millis(5)).await;
            self.handled
                .fetch_add(batch.envelopes.len(), Ordering::SeqCst);

            if batch.shutdown || self.stopping {
                // one extra cycle in draining before stopping
                if self.stopping {
                    return Ok(Cycle::Stopped);
                }
                self.stopping = true;
                return Ok(Cycle::Draining);
            }
            Ok(Cycle::Continue)
        }

        async fn recover(&mut self) -> AgentResult<()> {
            self.recovered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(inbox: Inbox, panic_once: bool) -> (Counter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let handled = Arc::new(AtomicUsize::new(0));
        let recovered = Arc::new(AtomicUsize::new(0));
        let module = Counter {
            descriptor: ModuleDescriptor::new(inbox.name(), 1, ModuleGroup::Handler),
            inbox,
            handled: handled.clone(),
            recovered: recovered.clone(),
            panic_once,
            stopping: false,
        };
        (module, handled, recovered)
    }

    fn request() -> Envelope {
        Envelope::new(Body::SensorRequest(Payload::default()))
    }

    #[tokio::test]
    async fn test_module_lifecycle_through_shutdown() {
        let mut builder = QueueRegistry::builder();
        let inbox = builder.register("counter");
        let registry = builder.build();

        let (module, handled, _) = counter(inbox, false);
        let mut scheduler = Scheduler::new(fast_settings(), registry.clone());
        scheduler.add(Box::new(module));

        let board = scheduler.status_board();
        assert_eq!(board.get("counter"), Some(Lifecycle::Registered));

        let handle = scheduler.start();
        assert!(board.wait_for("counter", Lifecycle::Running, Duration::from_secs(1)).await);

        for _ in 0..3 {
            registry.send("counter", request()).unwrap();
        }
        assert_eq!(handle.shutdown(), 1);

        assert!(board.wait_for("counter", Lifecycle::Stopped, Duration::from_secs(2)).await);
        handle.join().await;
        assert_eq!(handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_recovered() {
        let mut builder = QueueRegistry::builder();
        let failing_inbox = builder.register("failing");
        let healthy_inbox = builder.register("healthy");
        let registry = builder.build();

        let (failing, failing_handled, recovered) = counter(failing_inbox, true);
        let (healthy, healthy_handled, _) = counter(healthy_inbox, false);

        let mut scheduler = Scheduler::new(fast_settings(), registry.clone());
        scheduler.add(Box::new(failing));
        scheduler.add(Box::new(healthy));
        let handle = scheduler.start();

        registry.send("failing", request()).unwrap();
        registry.send("healthy", request()).unwrap();
        handle.shutdown();

        let board = handle.statuses().clone();
        assert!(board.wait_for("failing", Lifecycle::Stopped, Duration::from_secs(2)).await);
        assert!(board.wait_for("healthy", Lifecycle::Stopped, Duration::from_secs(2)).await);
        handle.join().await;

        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        assert_eq!(failing_handled.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_handled.load(Ordering::SeqCst), 1);
    }

    struct Observer {
        descriptor: ModuleDescriptor,
        inbox: Inbox,
        board: StatusBoard,
        seen_at_shutdown: Arc<Mutex<Option<Lifecycle>>>,
    }

    #[async_trait]
    impl Module for Observer {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn run_once(&mut self) -> AgentResult<Cycle> {
            let batch = next_batch(&mut self.inbox, Duration::from_millis(5)).await;
            Ok(if batch.shutdown { Cycle::Stopped } else { Cycle::Continue })
        }

        async fn shutdown(&mut self) {
            let state = self.board.get(&self.descriptor.name);
            *self.seen_at_shutdown.lock().unwrap() = state;
        }
    }

    #[tokio::test]
    async fn test_module_stopping_at_once_still_passes_draining() {
        let mut builder = QueueRegistry::builder();
        let inbox = builder.register("observer");
        let registry = builder.build();

        let mut scheduler = Scheduler::new(fast_settings(), registry);
        let board = scheduler.status_board();
        let seen_at_shutdown = Arc::new(Mutex::new(None));
        scheduler.add(Box::new(Observer {
            descriptor: ModuleDescriptor::new("observer", 1, ModuleGroup::Handler),
            inbox,
            board: board.clone(),
            seen_at_shutdown: seen_at_shutdown.clone(),
        }));
        let handle = scheduler.start();
        assert!(board.wait_for("observer", Lifecycle::Running, Duration::from_secs(1)).await);

        handle.shutdown();
        assert!(board.wait_for("observer", Lifecycle::Stopped, Duration::from_secs(2)).await);
        handle.join().await;

        assert_eq!(*seen_at_shutdown.lock().unwrap(), Some(Lifecycle::Draining));
    }

    struct Stuck {
        descriptor: ModuleDescriptor,
        recovered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Stuck {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn run_once(&mut self) -> AgentResult<Cycle> {
            if self.recovered.load(Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(Cycle::Stopped)
        }

        async fn recover(&mut self) -> AgentResult<()> {
            self.recovered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_cycle_times_out() {
        let registry = QueueRegistry::builder().build();
        let recovered = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(fast_settings(), registry);
        scheduler.add(Box::new(Stuck {
            descriptor: ModuleDescriptor::new("stuck", 1, ModuleGroup::Sensor),
            recovered: recovered.clone(),
        }));
        let handle = scheduler.start();
        let board = handle.statuses().clone();

        assert!(board.wait_for("stuck", Lifecycle::Stopped, Duration::from_secs(10)).await);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        handle.join().await;
    }
}
