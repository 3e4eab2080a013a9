//! Shared state threaded through every gateway component.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use daemons::{ArkDaemon, LightningDaemon, TapDaemon};
use monitoring::GatewayMetrics;
use store::Store;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::debug;

use crate::config::Config;
use crate::outbound::Notifier;

/// Everything a worker needs, cheap to clone.
#[derive(Clone)]
pub struct SharedState {
    pub store: Store,
    pub ark: Arc<dyn ArkDaemon>,
    pub tap: Arc<dyn TapDaemon>,
    pub lightning: Arc<dyn LightningDaemon>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: Arc<Config>,

    /// Ceremonies parked in signature collection wait on these.
    response_signals: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    /// Sessions flagged for cooperative cancellation.
    cancel_flags: Arc<Mutex<HashSet<String>>>,
    /// Bounds concurrent dispatcher work.
    pub worker_pool: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
}

impl SharedState {
    pub fn new(
        store: Store,
        ark: Arc<dyn ArkDaemon>,
        tap: Arc<dyn TapDaemon>,
        lightning: Arc<dyn LightningDaemon>,
        notifier: Arc<dyn Notifier>,
        config: Arc<Config>,
    ) -> Self {
        let worker_pool = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            store,
            ark,
            tap,
            lightning,
            notifier,
            metrics: Arc::new(GatewayMetrics::default()),
            config,
            response_signals: Arc::new(Mutex::new(HashMap::new())),
            cancel_flags: Arc::new(Mutex::new(HashSet::new())),
            worker_pool,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal handle a parked ceremony waits on for its session.
    pub async fn response_signal(&self, session_id: &str) -> Arc<Notify> {
        let mut signals = self.response_signals.lock().await;
        signals
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the ceremony waiting on this session, if any.
    pub async fn wake_session(&self, session_id: &str) {
        let signals = self.response_signals.lock().await;
        if let Some(notify) = signals.get(session_id) {
            notify.notify_waiters();
            debug!("woke ceremony for session {session_id}");
        }
    }

    pub async fn drop_signal(&self, session_id: &str) {
        self.response_signals.lock().await.remove(session_id);
    }

    pub async fn request_cancel(&self, session_id: &str) {
        self.cancel_flags
            .lock()
            .await
            .insert(session_id.to_string());
        self.wake_session(session_id).await;
    }

    pub async fn is_cancelled(&self, session_id: &str) -> bool {
        self.cancel_flags.lock().await.contains(session_id)
    }

    pub async fn clear_cancel(&self, session_id: &str) {
        self.cancel_flags.lock().await.remove(session_id);
    }

    pub fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Session deadline for a new session starting now.
    pub fn session_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.config.session_timeout_secs)
    }

    /// Challenge deadline, clamped to the session's own deadline.
    pub fn challenge_deadline(
        &self,
        now: DateTime<Utc>,
        session_expires_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let challenge = now + ChronoDuration::seconds(self.config.challenge_timeout_secs);
        challenge.min(session_expires_at)
    }
}
