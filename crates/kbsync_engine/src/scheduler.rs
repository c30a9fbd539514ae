//! Timer, change and connectivity driven sync scheduling.

use crate::config::SchedulerConfig;
use crate::engine::{SyncCycleResult, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::progress::SyncProgress;
use kbsync_protocol::now_millis;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the engine progress channel.
const PROGRESS_BUFFER: usize = 64;

/// Coarse scheduler status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerStatus {
    /// Waiting for a trigger.
    #[default]
    Idle,
    /// A session is running.
    Syncing,
    /// The last session reported errors.
    Error,
    /// Connectivity is down; triggers are skipped.
    Offline,
}

/// State published to subscribers on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    /// Current status.
    pub status: SchedulerStatus,
    /// End of the last session, Unix millis.
    pub last_sync_time: Option<i64>,
    /// Outcome of the last session.
    pub last_sync_result: Option<SyncCycleResult>,
    /// Local items waiting to be pushed.
    pub pending_changes: usize,
    /// Last reported connectivity.
    pub is_online: bool,
    /// Latest progress of the running session.
    pub progress: Option<SyncProgress>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            status: SchedulerStatus::Idle,
            last_sync_time: None,
            last_sync_result: None,
            pending_changes: 0,
            is_online: true,
            progress: None,
        }
    }
}

#[derive(Default)]
struct Tasks {
    runtime: Option<Handle>,
    interval: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    progress: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.interval.take(),
            self.debounce.take(),
            self.progress.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.runtime = None;
    }
}

struct Inner {
    engine: Arc<SyncEngine>,
    config: RwLock<SchedulerConfig>,
    state: watch::Sender<SchedulerState>,
    tasks: Mutex<Tasks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

impl Inner {
    /// Runs one session unless one is already running or the device is
    /// offline. Triggers arriving mid-session are dropped.
    async fn run_session(self: &Arc<Self>) -> Option<SyncCycleResult> {
        let started = self.state.send_if_modified(|state| {
            if state.status == SchedulerStatus::Syncing || !state.is_online {
                return false;
            }
            state.status = SchedulerStatus::Syncing;
            state.progress = None;
            true
        });
        if !started {
            debug!("sync trigger ignored");
            return None;
        }

        let inner = Arc::clone(self);
        // The session finishes and publishes its result even if the
        // awaiting task is aborted.
        let session = tokio::task::spawn_blocking(move || {
            let result = inner.engine.sync();
            inner.publish_result(&result);
            result
        });

        match session.await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "sync session task failed");
                let result = SyncCycleResult {
                    errors: vec![format!("sync task failed: {e}")],
                    ..SyncCycleResult::default()
                };
                self.publish_result(&result);
                Some(result)
            }
        }
    }

    fn publish_result(&self, result: &SyncCycleResult) {
        let pending = self.engine.pending_count().ok();
        self.state.send_modify(|state| {
            state.status = if !state.is_online {
                SchedulerStatus::Offline
            } else if result.success {
                SchedulerStatus::Idle
            } else {
                SchedulerStatus::Error
            };
            state.last_sync_time = Some(now_millis());
            state.last_sync_result = Some(result.clone());
            if let Some(pending) = pending {
                state.pending_changes = pending;
            }
        });
    }

    fn refresh_pending(&self) {
        if let Ok(pending) = self.engine.pending_count() {
            self.state.send_if_modified(|state| {
                let changed = state.pending_changes != pending;
                state.pending_changes = pending;
                changed
            });
        }
    }

    fn spawn_interval(self: &Arc<Self>, tasks: &mut Tasks) {
        if let Some(task) = tasks.interval.take() {
            task.abort();
        }
        let (Some(runtime), Some(period)) = (&tasks.runtime, self.config.read().interval()) else {
            return;
        };
        let weak = Arc::downgrade(self);
        tasks.interval = Some(runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                debug!("interval sync");
                inner.run_session().await;
            }
        }));
    }
}

/// Drives a [`SyncEngine`] from timers, local edits and connectivity.
///
/// Cloning yields another handle to the same scheduler. Background tasks
/// stop when the last handle is dropped.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    /// Creates a stopped scheduler.
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let initial = SchedulerState {
            pending_changes: engine.pending_count().unwrap_or(0),
            ..SchedulerState::default()
        };
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                engine,
                config: RwLock::new(config),
                state,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// The engine being driven.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    /// Starts the background tasks on the current tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        let runtime = Handle::try_current()
            .map_err(|_| SyncError::Config("scheduler requires a tokio runtime".into()))?;

        let mut tasks = self.inner.tasks.lock();
        if tasks.runtime.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let (sender, receiver) = mpsc::channel(PROGRESS_BUFFER);
        self.inner.engine.set_progress_sender(Some(sender));
        tasks.progress = Some(runtime.spawn(consume_progress(
            Arc::downgrade(&self.inner),
            receiver,
        )));
        tasks.runtime = Some(runtime.clone());
        self.inner.spawn_interval(&mut tasks);

        let config = self.inner.config.read().clone();
        if config.auto_sync_on_start {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                inner.run_session().await;
            });
        }
        info!(
            interval_secs = config.sync_interval.as_secs(),
            debounce_secs = config.change_debounce.as_secs(),
            "sync scheduler started"
        );
        Ok(())
    }

    /// Stops all background tasks. A running session still completes.
    pub fn stop(&self) {
        self.inner.tasks.lock().abort_all();
        self.inner.engine.set_progress_sender(None);
        info!("sync scheduler stopped");
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_started(&self) -> bool {
        self.inner.tasks.lock().runtime.is_some()
    }

    /// Runs a session now. Returns `None` if it was skipped.
    pub async fn trigger_sync(&self) -> Option<SyncCycleResult> {
        self.inner.run_session().await
    }

    /// Signals a local edit. Bursts of edits collapse into one session
    /// after the debounce window.
    pub fn notify_change(&self) {
        self.inner.refresh_pending();

        let config = self.inner.config.read().clone();
        if !config.sync_on_change {
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        let Some(runtime) = tasks.runtime.clone() else {
            return;
        };
        if let Some(task) = tasks.debounce.take() {
            task.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        tasks.debounce = Some(runtime.spawn(async move {
            time::sleep(config.change_debounce).await;
            if let Some(inner) = weak.upgrade() {
                debug!("debounced change sync");
                inner.run_session().await;
            }
        }));
    }

    /// Reports connectivity. Going online runs a session immediately.
    pub async fn set_online(&self, online: bool) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            state.is_online = online;
            if state.status != SchedulerStatus::Syncing {
                state.status = if online {
                    SchedulerStatus::Idle
                } else {
                    SchedulerStatus::Offline
                };
            }
            true
        });
        if !changed {
            return;
        }
        info!(online, "connectivity changed");
        if online {
            self.inner.run_session().await;
        }
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SchedulerState {
        self.inner.state.borrow().clone()
    }

    /// Current configuration.
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config.read().clone()
    }

    /// Replaces the configuration, rescheduling the interval timer.
    pub fn update_config(&self, config: SchedulerConfig) {
        *self.inner.config.write() = config;
        let mut tasks = self.inner.tasks.lock();
        self.inner.spawn_interval(&mut tasks);
    }
}

async fn consume_progress(inner: Weak<Inner>, mut receiver: mpsc::Receiver<SyncProgress>) {
    while let Some(progress) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.state.send_modify(|state| state.progress = Some(progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::config::SyncConfig;
    use crate::store::{LocalStore, MemoryStore};
    use kbsync_crypto::CryptoEngine;
    use kbsync_protocol::Item;
    use std::time::Duration;

    fn fixture(items: Vec<Item>) -> (Arc<MemoryAdapter>, Arc<MemoryStore>, SyncScheduler) {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = Arc::new(MemoryStore::from_items(items));
        let engine = Arc::new(SyncEngine::new(
            SyncConfig::new("device-a"),
            adapter.clone(),
            store.clone(),
            Arc::new(CryptoEngine::new()),
        ));
        let config = SchedulerConfig::default()
            .with_sync_interval(Duration::ZERO)
            .with_change_debounce(Duration::from_millis(50));
        (adapter, store, SyncScheduler::new(engine, config))
    }

    async fn wait_for_result(scheduler: &SyncScheduler) -> SchedulerState {
        let mut receiver = scheduler.subscribe();
        let state = time::timeout(
            Duration::from_secs(5),
            receiver.wait_for(|state| {
                state.last_sync_result.is_some() && state.status != SchedulerStatus::Syncing
            }),
        )
        .await
        .expect("timed out waiting for a session")
        .expect("scheduler dropped")
        .clone();
        state
    }

    #[tokio::test]
    async fn manual_trigger_publishes_result() {
        let (_, _, scheduler) = fixture(vec![Item::with_id("a", "note", "1")]);
        assert_eq!(scheduler.state().pending_changes, 1);

        let result = scheduler.trigger_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.pushed, 1);

        let state = scheduler.state();
        assert_eq!(state.status, SchedulerStatus::Idle);
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_time.is_some());
        assert_eq!(state.last_sync_result, Some(result));
    }

    #[tokio::test]
    async fn failed_session_sets_error_status() {
        let (adapter, _, scheduler) = fixture(vec![]);
        adapter.set_offline(true);

        let result = scheduler.trigger_sync().await.unwrap();
        assert!(!result.success);
        let state = scheduler.state();
        assert_eq!(state.status, SchedulerStatus::Error);
        assert_eq!(state.last_sync_result.unwrap().errors, result.errors);
    }

    #[tokio::test]
    async fn trigger_during_session_is_dropped() {
        let (_, _, scheduler) = fixture(vec![]);
        scheduler
            .inner
            .state
            .send_modify(|state| state.status = SchedulerStatus::Syncing);

        assert!(scheduler.trigger_sync().await.is_none());
        assert_eq!(scheduler.engine().stats().cycles_completed, 0);
    }

    #[tokio::test]
    async fn offline_skips_and_reconnect_syncs() {
        let (_, _, scheduler) = fixture(vec![Item::with_id("a", "note", "1")]);

        scheduler.set_online(false).await;
        assert_eq!(scheduler.state().status, SchedulerStatus::Offline);
        assert!(scheduler.trigger_sync().await.is_none());

        scheduler.set_online(true).await;
        let state = scheduler.state();
        assert_eq!(state.status, SchedulerStatus::Idle);
        assert_eq!(state.last_sync_result.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn change_bursts_are_debounced() {
        let (_, store, scheduler) = fixture(vec![]);
        scheduler.start().unwrap();

        for n in 0..3 {
            store.create("note", &format!("edit {n}")).unwrap();
            scheduler.notify_change();
        }
        assert_eq!(scheduler.state().pending_changes, 3);

        let state = wait_for_result(&scheduler).await;
        assert_eq!(state.last_sync_result.unwrap().pushed, 3);

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.engine().stats().cycles_completed, 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn auto_sync_on_start_and_progress() {
        let (_, _, scheduler) = fixture(vec![Item::with_id("a", "note", "1")]);
        scheduler.update_config(scheduler.config().with_auto_sync_on_start(true));
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SyncError::AlreadyRunning)));

        let state = wait_for_result(&scheduler).await;
        assert!(state.last_sync_result.unwrap().success);

        scheduler.stop();
        assert!(!scheduler.is_started());
    }

    #[tokio::test]
    async fn interval_timer_runs_sessions() {
        let (_, _, scheduler) = fixture(vec![Item::with_id("a", "note", "1")]);
        scheduler.update_config(
            scheduler
                .config()
                .with_sync_interval(Duration::from_millis(100)),
        );
        scheduler.start().unwrap();
        // The first tick is one period after start.
        assert!(scheduler.state().last_sync_result.is_none());

        let state = wait_for_result(&scheduler).await;
        assert_eq!(state.last_sync_result.unwrap().pushed, 1);

        time::sleep(Duration::from_millis(350)).await;
        assert!(scheduler.engine().stats().cycles_completed >= 2);

        // A zero interval cancels the timer.
        scheduler.update_config(scheduler.config().with_sync_interval(Duration::ZERO));
        time::sleep(Duration::from_millis(50)).await;
        let settled = scheduler.engine().stats().cycles_completed;
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.engine().stats().cycles_completed, settled);
        scheduler.stop();
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (_, _, scheduler) = fixture(vec![]);
        assert!(matches!(scheduler.start(), Err(SyncError::Config(_))));
    }
}
