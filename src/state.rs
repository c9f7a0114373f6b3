use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::analyzer::AgentStateAnalysis;
use crate::config::SessionContinuationConfig;

/// How many times a session has been evaluated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationTracking {
    pub session_name: String,
    pub iterations: u32,
    pub updated_at: DateTime<Utc>,
}

impl IterationTracking {
    fn new(session_name: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            iterations: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Read view of a session's supervision state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContinuationStatus {
    pub session_name: String,
    pub is_monitored: bool,
    pub last_analysis: Option<AgentStateAnalysis>,
}

/// A message for the session's human owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationNotification {
    pub session_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub acknowledged: bool,
}

/// Everything the supervisor keeps for one session. Guarded by a per-session
/// mutex so evaluations of the same session never interleave.
#[derive(Debug)]
pub struct SessionState {
    pub config: SessionContinuationConfig,
    pub tracking: Option<IterationTracking>,
    pub status: Option<SessionContinuationStatus>,
}

impl SessionState {
    fn new(config: SessionContinuationConfig) -> Self {
        Self {
            config,
            tracking: None,
            status: None,
        }
    }

    /// Advance the iteration counter by one and return the new count
    pub fn increment_iteration(&mut self, session_name: &str) -> u32 {
        let tracking = self
            .tracking
            .get_or_insert_with(|| IterationTracking::new(session_name));
        tracking.iterations += 1;
        tracking.updated_at = Utc::now();
        tracking.iterations
    }

    /// Set the iteration counter back to zero. Returns `false` when the
    /// session was never evaluated; no tracking record is created then.
    pub fn reset_iterations(&mut self) -> bool {
        match self.tracking.as_mut() {
            Some(tracking) => {
                tracking.iterations = 0;
                tracking.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Record the latest analysis and mark the session monitored
    pub fn record_analysis(&mut self, session_name: &str, analysis: AgentStateAnalysis) {
        self.status = Some(SessionContinuationStatus {
            session_name: session_name.to_string(),
            is_monitored: true,
            last_analysis: Some(analysis),
        });
    }
}

/// Shared per-session state for concurrent access between the event loop and
/// direct callers
#[derive(Debug)]
pub struct SharedState {
    defaults: SessionContinuationConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
    notifications: RwLock<Vec<ContinuationNotification>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(SessionContinuationConfig::default())
    }
}

impl SharedState {
    /// Create state that seeds new sessions with `defaults`
    pub fn new(defaults: SessionContinuationConfig) -> Self {
        Self {
            defaults: defaults.normalized(),
            sessions: RwLock::new(HashMap::new()),
            notifications: RwLock::new(Vec::new()),
        }
    }

    /// Get the session's state, creating it with defaults on first use
    pub async fn session(&self, session_name: &str) -> Arc<Mutex<SessionState>> {
        if let Some(session) = self.sessions.read().await.get(session_name) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(self.defaults.clone()))));
        Arc::clone(session)
    }

    /// Get the session's state without creating it
    pub async fn existing_session(&self, session_name: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().await.get(session_name).cloned()
    }

    /// Snapshot of all known sessions
    pub async fn sessions(&self) -> Vec<(String, Arc<Mutex<SessionState>>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), Arc::clone(session)))
            .collect()
    }

    /// Append a notification
    pub async fn push_notification(&self, notification: ContinuationNotification) {
        self.notifications.write().await.push(notification);
    }

    /// All notifications, optionally only the unacknowledged ones
    pub async fn notifications(&self, unacknowledged_only: bool) -> Vec<ContinuationNotification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| !unacknowledged_only || !n.acknowledged)
            .cloned()
            .collect()
    }

    /// Mark notifications with the given timestamp acknowledged, returning
    /// how many changed
    pub async fn acknowledge(&self, timestamp: DateTime<Utc>) -> usize {
        let mut notifications = self.notifications.write().await;
        let mut changed = 0;
        for notification in notifications
            .iter_mut()
            .filter(|n| n.timestamp == timestamp && !n.acknowledged)
        {
            notification.acknowledged = true;
            changed += 1;
        }
        changed
    }

    /// Drop every session and notification
    pub async fn clear(&self) {
        self.sessions.write().await.clear();
        self.notifications.write().await.clear();
    }
}
