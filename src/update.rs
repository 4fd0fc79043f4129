//! Hands control over from the running application code to a newly installed version.
//!
//! A new version is installed by a background worker and waits until it is told to take over. The
//! coordinator asks the user once per session, purges the caches that hold UI assets (never the
//! cached API data), tells the worker to activate and reloads exactly once after the worker
//! reports that it has taken control.

use crate::config::SyncSettings;
use crate::db::{self, keys, Store};
use crate::utils;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    UpdateDetected,
    UserPrompted,
    Updating,
    Reloading,
}

serde_plain::derive_display_from_serialize!(UpdateState);

/// The only message sent to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCommand {
    ActivateNow,
}

/// The only message the worker sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAck {
    ControlTransferred,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    /// The worker did not take control in time. Nothing was reloaded and the update can be
    /// accepted again.
    #[error("the new version did not take control within {0:?}")]
    ActivationTimeout(Duration),

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: UpdateState,
    },

    #[error("the worker channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Messaging with the background worker that installed the new version.
#[async_trait::async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Acknowledgments sent after this call are delivered to the returned receiver.
    fn subscribe(&self) -> broadcast::Receiver<WorkerAck>;

    async fn post(&self, command: WorkerCommand) -> Result<()>;
}

/// The named caches of the application.
#[async_trait::async_trait]
pub trait AssetCaches: Send + Sync {
    async fn names(&self) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Restarts the application on the new code.
pub trait Reloader: Send + Sync {
    fn reload(&self);
}

/// An in-process worker. By default it activates as soon as it is told to.
#[derive(Debug)]
pub struct LocalWorker {
    acks: broadcast::Sender<WorkerAck>,
    responsive: bool,
    received: Mutex<Vec<WorkerCommand>>,
}

impl Default for LocalWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalWorker {
    pub fn new() -> Self {
        let (acks, _) = broadcast::channel(8);
        Self {
            acks,
            responsive: true,
            received: Mutex::new(Vec::new()),
        }
    }

    /// A worker that never acknowledges.
    pub fn unresponsive() -> Self {
        Self {
            responsive: false,
            ..Self::new()
        }
    }

    /// Commands received so far.
    pub fn received(&self) -> Vec<WorkerCommand> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Announces that the worker took control, as if another window had activated it.
    pub fn transfer_control(&self) {
        // Nobody listening is fine.
        let _ = self.acks.send(WorkerAck::ControlTransferred);
    }
}

#[async_trait::async_trait]
impl WorkerChannel for LocalWorker {
    fn subscribe(&self) -> broadcast::Receiver<WorkerAck> {
        self.acks.subscribe()
    }

    async fn post(&self, command: WorkerCommand) -> Result<()> {
        debug!("Worker received {command:?}");
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        match command {
            WorkerCommand::ActivateNow if self.responsive => self.transfer_control(),
            WorkerCommand::ActivateNow => {}
        }
        Ok(())
    }
}

/// Caches stored as directories under `root`, one per cache name.
#[derive(Debug, Clone)]
pub struct DirAssetCaches {
    root: PathBuf,
}

impl DirAssetCaches {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl AssetCaches for DirAssetCaches {
    async fn names(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        utils::subdirectories(&self.root).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        utils::remove_dir(&self.root.join(name)).await
    }
}

/// See the module documentation.
pub struct UpdateCoordinator {
    worker: Arc<dyn WorkerChannel>,
    caches: Arc<dyn AssetCaches>,
    reloader: Arc<dyn Reloader>,
    store: Arc<dyn Store>,
    keywords: Vec<String>,
    snooze: chrono::Duration,
    activation_timeout: Duration,
    state: UpdateState,
    prompted: bool,
    reloaded: bool,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("state", &self.state)
            .field("prompted", &self.prompted)
            .field("reloaded", &self.reloaded)
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    pub fn new(
        worker: Arc<dyn WorkerChannel>,
        caches: Arc<dyn AssetCaches>,
        reloader: Arc<dyn Reloader>,
        store: Arc<dyn Store>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            worker,
            caches,
            reloader,
            store,
            keywords: settings
                .ui_asset_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            snooze: chrono::Duration::from_std(settings.snooze())
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            activation_timeout: settings.activation_timeout(),
            state: UpdateState::Idle,
            prompted: false,
            reloaded: false,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// A new version was already waiting when the application started. Returns whether the user
    /// should be prompted now.
    pub async fn waiting_worker_found(&mut self) -> std::result::Result<bool, UpdateError> {
        self.detected(Utc::now()).await
    }

    /// A new version finished installing while the application was running. Returns whether the
    /// user should be prompted now.
    pub async fn worker_installed(&mut self) -> std::result::Result<bool, UpdateError> {
        self.detected(Utc::now()).await
    }

    /// The prompt gate: at most once per session and never while snoozed.
    async fn detected(&mut self, now: DateTime<Utc>) -> std::result::Result<bool, UpdateError> {
        if matches!(self.state, UpdateState::Updating | UpdateState::Reloading) {
            return Ok(false);
        }
        self.state = UpdateState::UpdateDetected;
        if self.prompted {
            debug!("Update already offered in this session");
            return Ok(false);
        }
        if let Some(until) = self.snoozed_until().await? {
            if until > now {
                debug!("Update prompt snoozed until {until}");
                return Ok(false);
            }
        }
        self.prompted = true;
        self.state = UpdateState::UserPrompted;
        info!("A new version is ready");
        Ok(true)
    }

    pub async fn snoozed_until(&self) -> std::result::Result<Option<DateTime<Utc>>, UpdateError> {
        Ok(db::load_state(self.store.as_ref(), keys::SNOOZED_UNTIL).await?)
    }

    /// "Not now": hides the prompt until the snooze expires. An unexpired snooze is kept as is.
    pub async fn defer(&mut self) -> std::result::Result<DateTime<Utc>, UpdateError> {
        let now = Utc::now();
        let until = match self.snoozed_until().await? {
            Some(until) if until > now => until,
            _ => {
                let until = now + self.snooze;
                db::save_state(self.store.as_ref(), keys::SNOOZED_UNTIL, &until).await?;
                until
            }
        };
        self.state = UpdateState::Idle;
        info!("Update postponed until {until}");
        Ok(until)
    }

    /// Whether the cache `name` holds UI assets.
    pub fn is_ui_asset(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k.as_str()))
    }

    /// Deletes the UI-asset caches and returns their names.
    pub async fn purge_ui_caches(&self) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for name in self.caches.names().await? {
            if self.is_ui_asset(&name) {
                self.caches.delete(&name).await?;
                purged.push(name);
            }
        }
        info!("Purged {} UI asset cache(s)", purged.len());
        Ok(purged)
    }

    /// "Update now".
    pub async fn accept(&mut self) -> std::result::Result<(), UpdateError> {
        if self.state != UpdateState::UserPrompted {
            return Err(UpdateError::InvalidState {
                action: "accept an update",
                state: self.state,
            });
        }
        self.state = UpdateState::Updating;
        // Subscribe first so that a fast acknowledgment cannot be missed.
        let mut acks = self.worker.subscribe();
        let activation = self.activate(&mut acks);
        let result = match tokio::time::timeout(self.activation_timeout, activation).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::ActivationTimeout(self.activation_timeout)),
        };
        match result {
            Ok(()) => {
                self.control_transferred();
                Ok(())
            }
            Err(e) => {
                warn!("Update failed: {e}");
                self.state = UpdateState::UserPrompted;
                Err(e)
            }
        }
    }

    async fn activate(
        &self,
        acks: &mut broadcast::Receiver<WorkerAck>,
    ) -> std::result::Result<(), UpdateError> {
        self.purge_ui_caches().await?;
        self.worker.post(WorkerCommand::ActivateNow).await?;
        loop {
            match acks.recv().await {
                Ok(WorkerAck::ControlTransferred) => return Ok(()),
                Err(RecvError::Lagged(n)) => debug!("Missed {n} worker message(s)"),
                Err(RecvError::Closed) => return Err(UpdateError::ChannelClosed),
            }
        }
    }

    /// The new version took control. Reloads once per session, however often this is reported.
    pub fn control_transferred(&mut self) {
        self.state = UpdateState::Reloading;
        if self.reloaded {
            debug!("Already reloading");
            return;
        }
        self.reloaded = true;
        info!("Reloading on the new version");
        self.reloader.reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct CountingReloader(AtomicUsize);

    impl Reloader for CountingReloader {
        fn reload(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingReloader {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Setup {
        _dir: TempDir,
        caches: DirAssetCaches,
        worker: Arc<LocalWorker>,
        reloader: Arc<CountingReloader>,
        store: Arc<MemoryStore>,
        coordinator: UpdateCoordinator,
    }

    async fn setup(worker: LocalWorker) -> Setup {
        let dir = TempDir::new().unwrap();
        for name in ["app-shell", "workbox-v2", "user-photos"] {
            utils::make_dir(dir.path().join(name)).await.unwrap();
        }
        let caches = DirAssetCaches::new(dir.path());
        let worker = Arc::new(worker);
        let reloader = Arc::new(CountingReloader::default());
        let store = Arc::new(MemoryStore::new());
        let settings = SyncSettings {
            activation_timeout_ms: 50,
            ..SyncSettings::default()
        };
        let coordinator = UpdateCoordinator::new(
            worker.clone(),
            Arc::new(caches.clone()),
            reloader.clone(),
            store.clone(),
            &settings,
        );
        Setup {
            _dir: dir,
            caches,
            worker,
            reloader,
            store,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_accept_purges_ui_caches_and_reloads_once() {
        let mut s = setup(LocalWorker::new()).await;
        assert!(s.coordinator.waiting_worker_found().await.unwrap());
        s.coordinator.accept().await.unwrap();

        assert_eq!(s.caches.names().await.unwrap(), vec!["user-photos"]);
        assert_eq!(s.worker.received(), vec![WorkerCommand::ActivateNow]);
        assert_eq!(s.coordinator.state(), UpdateState::Reloading);
        assert_eq!(s.reloader.count(), 1);

        s.coordinator.control_transferred();
        assert_eq!(s.reloader.count(), 1);
    }

    #[tokio::test]
    async fn test_activation_timeout_does_not_reload() {
        let mut s = setup(LocalWorker::unresponsive()).await;
        assert!(s.coordinator.worker_installed().await.unwrap());
        let err = s.coordinator.accept().await.unwrap_err();
        assert!(matches!(err, UpdateError::ActivationTimeout(_)));
        assert_eq!(s.coordinator.state(), UpdateState::UserPrompted);
        assert_eq!(s.reloader.count(), 0);

        // Retrying is allowed and succeeds once the worker takes over.
        let worker = s.worker.clone();
        let ack = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.transfer_control();
        });
        s.coordinator.accept().await.unwrap();
        ack.await.unwrap();
        assert_eq!(s.reloader.count(), 1);
    }

    #[tokio::test]
    async fn test_two_dismissals_store_one_timestamp() {
        let mut s = setup(LocalWorker::new()).await;
        assert!(s.coordinator.waiting_worker_found().await.unwrap());
        let first = s.coordinator.defer().await.unwrap();
        let second = s.coordinator.defer().await.unwrap();
        assert_eq!(first, second);
        let stored = s.store.get_state(keys::SNOOZED_UNTIL).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<DateTime<Utc>>(&stored).unwrap(), first);
        assert_eq!(s.coordinator.state(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_prompt_once_per_session_and_honor_snooze() {
        let mut s = setup(LocalWorker::new()).await;
        assert!(s.coordinator.waiting_worker_found().await.unwrap());
        assert!(!s.coordinator.worker_installed().await.unwrap());
        s.coordinator.defer().await.unwrap();

        // A new session with the same store stays quiet while snoozed.
        let settings = SyncSettings::default();
        let mut next = UpdateCoordinator::new(
            s.worker.clone(),
            Arc::new(s.caches.clone()),
            s.reloader.clone(),
            s.store.clone(),
            &settings,
        );
        assert!(!next.waiting_worker_found().await.unwrap());
        assert_eq!(next.state(), UpdateState::UpdateDetected);

        let expired = Utc::now() - chrono::Duration::minutes(1);
        db::save_state(&*s.store, keys::SNOOZED_UNTIL, &expired)
            .await
            .unwrap();
        assert!(next.worker_installed().await.unwrap());
        assert_eq!(next.state(), UpdateState::UserPrompted);
    }

    #[tokio::test]
    async fn test_accept_requires_prompt() {
        let mut s = setup(LocalWorker::new()).await;
        let err = s.coordinator.accept().await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::InvalidState {
                state: UpdateState::Idle,
                ..
            }
        ));
        assert_eq!(s.caches.names().await.unwrap().len(), 3);
    }

    #[test]
    fn test_ui_asset_keywords_ignore_case() {
        let coordinator = UpdateCoordinator::new(
            Arc::new(LocalWorker::new()),
            Arc::new(DirAssetCaches::new("/nonexistent")),
            Arc::new(CountingReloader::default()),
            Arc::new(MemoryStore::new()),
            &SyncSettings::default(),
        );
        assert!(coordinator.is_ui_asset("Workbox-Precache-v3"));
        assert!(coordinator.is_ui_asset("APP-SHELL"));
        assert!(!coordinator.is_ui_asset("user-photos"));
        assert!(!coordinator.is_ui_asset("api-responses"));
    }
}
