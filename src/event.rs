//! Continuation events and the bus that carries them to the supervisor.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, SupervisorError};

/// Default number of undelivered events the bus buffers per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What caused a continuation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationTrigger {
    /// The session produced no output for the idle timeout
    ActivityIdle,
    /// An API call or task monitor asked for a check
    ExplicitRequest,
    /// The session's process exited
    PtyExit,
}

impl fmt::Display for ContinuationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivityIdle => write!(f, "activity_idle"),
            Self::ExplicitRequest => write!(f, "explicit_request"),
            Self::PtyExit => write!(f, "pty_exit"),
        }
    }
}

/// Facts attached to an event by whoever raised it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Recent terminal output from the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    /// Exit status, for `pty_exit` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Task the session is assigned to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Anything else the publisher wants to carry along
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A request to evaluate whether a session should be continued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationEvent {
    pub trigger: ContinuationTrigger,
    pub session_name: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub project_path: PathBuf,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl ContinuationEvent {
    /// Create an event for a session, stamped with the current time
    pub fn new(trigger: ContinuationTrigger, session_name: impl Into<String>) -> Self {
        Self {
            trigger,
            session_name: session_name.into(),
            agent_id: String::new(),
            project_path: PathBuf::new(),
            timestamp: Utc::now(),
            metadata: EventMetadata::default(),
        }
    }

    /// Identify the agent running in the session
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    /// Working directory of the session
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = path.into();
        self
    }

    /// Terminal output captured when the trigger fired
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.metadata.last_output = Some(output.into());
        self
    }

    /// Exit code of the agent process, for `pty_exit` triggers
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.metadata.exit_code = Some(code);
        self
    }

    /// Task the session was assigned
    pub fn with_current_task(mut self, task: impl Into<String>) -> Self {
        self.metadata.current_task = Some(task.into());
        self
    }

    /// Output to analyze; a missing output is treated as empty
    pub fn output(&self) -> &str {
        self.metadata.last_output.as_deref().unwrap_or_default()
    }

    /// Parse an event from one line of JSON
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| SupervisorError::EventParseError(e.to_string()))
    }
}

/// Publish/subscribe channel carrying continuation events
#[derive(Debug, Clone)]
pub struct EventSource {
    tx: broadcast::Sender<ContinuationEvent>,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSource {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event, returning how many subscribers will see it.
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: ContinuationEvent) -> usize {
        let session = event.session_name.clone();
        let trigger = event.trigger;
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for {} event on {}; dropped", trigger, session);
                0
            }
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ContinuationEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
