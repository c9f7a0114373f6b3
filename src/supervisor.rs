//! Per-session continuation control loop.
//!
//! The supervisor consumes [`ContinuationEvent`]s, counts evaluations per
//! session, asks a [`StateAnalyzer`] what the session is doing and turns the
//! answer into a single action for the orchestration layer. It never performs
//! the action itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analyzer::{
    AgentStateAnalysis, AnalysisContext, OutputAnalyzer, Recommendation, StateAnalyzer,
};
use crate::config::{
    clamp_max_iterations, PromptTemplates, SessionContinuationConfig, SupervisorConfig,
};
use crate::error::{Result, SupervisorError};
use crate::event::{ContinuationEvent, ContinuationTrigger, EventSource};
use crate::message;
use crate::state::{
    ContinuationNotification, IterationTracking, SessionContinuationStatus, SharedState,
};

/// Outcome of handling one continuation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationResult {
    pub success: bool,
    pub action: Recommendation,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AgentStateAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContinuationResult {
    fn dispatched(action: Recommendation, message: String, analysis: AgentStateAnalysis) -> Self {
        Self {
            success: true,
            action,
            message,
            analysis: Some(analysis),
            error: None,
        }
    }

    fn disabled() -> Self {
        Self {
            success: true,
            action: Recommendation::NoAction,
            message: "continuation disabled for this session".to_string(),
            analysis: None,
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Self {
            success: false,
            action: Recommendation::NoAction,
            message: String::new(),
            analysis: None,
            error: Some(error),
        }
    }
}

/// A result produced by the event loop, tagged with its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedResult {
    pub session_name: String,
    pub trigger: ContinuationTrigger,
    pub result: ContinuationResult,
}

/// The running event loop and the channel that asks it to finish
struct Worker {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Stateful continuation supervisor
pub struct ContinuationSupervisor<A = OutputAnalyzer> {
    analyzer: A,
    state: SharedState,
    prompts: PromptTemplates,
    results: broadcast::Sender<DispatchedResult>,
    worker: Mutex<Option<Worker>>,
}

impl ContinuationSupervisor<OutputAnalyzer> {
    /// Create a supervisor backed by the pattern-based [`OutputAnalyzer`]
    pub fn new(config: &SupervisorConfig) -> Self {
        Self::with_analyzer(config, OutputAnalyzer::new())
    }
}

impl<A: StateAnalyzer> ContinuationSupervisor<A> {
    /// Create a supervisor with a custom analyzer
    pub fn with_analyzer(config: &SupervisorConfig, analyzer: A) -> Self {
        let (results, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            analyzer,
            state: SharedState::new(config.defaults.clone()),
            prompts: config.prompts.clone(),
            results,
            worker: Mutex::new(None),
        }
    }

    /// Evaluate one event and decide what the caller should do.
    ///
    /// Never fails: any error is reported as `success: false` so one bad event
    /// cannot stop supervision of other sessions.
    pub async fn handle_event(&self, event: &ContinuationEvent) -> ContinuationResult {
        match self.process_event(event).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Failed to handle {} event for {}: {}",
                    event.trigger, event.session_name, e
                );
                ContinuationResult::failure(e.to_string())
            }
        }
    }

    async fn process_event(&self, event: &ContinuationEvent) -> Result<ContinuationResult> {
        let name = event.session_name.as_str();
        if name.trim().is_empty() {
            return Err(SupervisorError::InvalidEvent("empty session name".to_string()));
        }

        let session = self.state.session(name).await;
        let mut session = session.lock().await;

        if !session.config.enabled {
            debug!("Continuation disabled for {}; ignoring {}", name, event.trigger);
            return Ok(ContinuationResult::disabled());
        }

        let iterations = session.increment_iteration(name);
        let context = AnalysisContext {
            current_task: event.metadata.current_task.clone(),
            iterations,
            max_iterations: session.config.max_iterations,
            exit_code: event.metadata.exit_code,
        };
        debug!(
            "Evaluating {} ({}), iteration {}/{}",
            name, event.trigger, iterations, context.max_iterations
        );

        let analysis = self.analyzer.analyze(name, event.output(), &context)?;

        let mut action = analysis.recommendation;
        let awaiting_approval =
            action == Recommendation::AssignNextTask && !session.config.auto_assign_next;
        if awaiting_approval {
            action = Recommendation::NotifyOwner;
        }

        session.record_analysis(name, analysis.clone());

        let text = if awaiting_approval {
            message::approval_message(name, &analysis)
        } else {
            message::compose(name, action, &analysis, &self.prompts)
        };

        if action == Recommendation::NotifyOwner {
            self.state
                .push_notification(ContinuationNotification {
                    session_name: name.to_string(),
                    timestamp: Utc::now(),
                    message: text.clone(),
                    acknowledged: false,
                })
                .await;
        }

        info!(
            "{}: {} ({:.2}) -> {}",
            name, analysis.conclusion, analysis.confidence, action
        );

        Ok(ContinuationResult::dispatched(action, text, analysis))
    }

    /// The session's config, created with defaults if the session is new
    pub async fn session_config(&self, session_name: &str) -> SessionContinuationConfig {
        self.state.session(session_name).await.lock().await.config.clone()
    }

    /// Set the session's iteration limit, clamped to `[1, 50]`. Returns the
    /// stored value.
    pub async fn set_max_iterations(&self, session_name: &str, max_iterations: u32) -> u32 {
        let clamped = clamp_max_iterations(max_iterations);
        if clamped != max_iterations {
            debug!(
                "Clamped max iterations for {} from {} to {}",
                session_name, max_iterations, clamped
            );
        }
        let session = self.state.session(session_name).await;
        session.lock().await.config.max_iterations = clamped;
        clamped
    }

    /// Turn evaluation on or off for a session
    pub async fn set_enabled(&self, session_name: &str, enabled: bool) {
        let session = self.state.session(session_name).await;
        session.lock().await.config.enabled = enabled;
    }

    /// Allow or forbid assigning the next task without a human
    pub async fn set_auto_assign_next(&self, session_name: &str, auto_assign_next: bool) {
        let session = self.state.session(session_name).await;
        session.lock().await.config.auto_assign_next = auto_assign_next;
    }

    /// Set the session's iteration counter back to zero. A session that was
    /// never evaluated is left without tracking.
    pub async fn reset_iterations(&self, session_name: &str) {
        let reset = match self.state.existing_session(session_name).await {
            Some(session) => {
                let mut session = session.lock().await;
                session.reset_iterations()
            }
            None => false,
        };
        if reset {
            info!("Reset iterations for {}", session_name);
        } else {
            debug!("No iterations to reset for {}", session_name);
        }
    }

    /// Evaluation count for a session, or `None` if it was never evaluated
    pub async fn iteration_tracking(&self, session_name: &str) -> Option<IterationTracking> {
        let session = self.state.existing_session(session_name).await?;
        let session = session.lock().await;
        session.tracking.clone()
    }

    /// Status of a session, or `None` if no event for it was ever handled
    pub async fn session_status(&self, session_name: &str) -> Option<SessionContinuationStatus> {
        let session = self.state.existing_session(session_name).await?;
        let session = session.lock().await;
        session.status.clone()
    }

    /// Names of all sessions with at least one handled event, sorted
    pub async fn active_monitors(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, session) in self.state.sessions().await {
            if session.lock().await.status.is_some() {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Notifications raised so far, oldest first
    pub async fn notifications(&self, unacknowledged_only: bool) -> Vec<ContinuationNotification> {
        self.state.notifications(unacknowledged_only).await
    }

    /// Acknowledge the notification(s) raised at `timestamp`. Returns whether
    /// anything changed.
    pub async fn acknowledge_notification(&self, timestamp: DateTime<Utc>) -> bool {
        self.state.acknowledge(timestamp).await > 0
    }

    /// Receive every result produced by the event loop
    pub fn subscribe_results(&self) -> broadcast::Receiver<DispatchedResult> {
        self.results.subscribe()
    }

    /// Forget all sessions and notifications. Meant for test harnesses.
    pub async fn reset(&self) {
        self.state.clear().await;
    }

    /// Whether the event loop is running
    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Stop consuming events. An event already being handled is finished and
    /// its result dispatched first. A no-op when not started.
    pub async fn stop(&self) {
        match self.worker.lock().await.take() {
            Some(worker) => {
                let _ = worker.shutdown.send(());
                if let Err(e) = worker.handle.await {
                    warn!("Event loop ended abnormally: {}", e);
                }
                info!("Continuation supervisor stopped");
            }
            None => debug!("Continuation supervisor not running; nothing to stop"),
        }
    }
}

impl<A: StateAnalyzer + 'static> ContinuationSupervisor<A> {
    /// Subscribe to `source` and handle its events one at a time on a
    /// background task. Calling this while already running is a no-op.
    pub async fn start(self: &Arc<Self>, source: &EventSource) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            warn!("Continuation supervisor already started");
            return;
        }

        let mut rx = source.subscribe();
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("Shutdown requested");
                        break;
                    }
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let result = supervisor.handle_event(&event).await;
                        let _ = supervisor.results.send(DispatchedResult {
                            session_name: event.session_name,
                            trigger: event.trigger,
                            result,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event loop lagged; {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event source closed");
                        break;
                    }
                }
            }
        });
        *worker = Some(Worker { shutdown, handle });
        info!("Continuation supervisor started");
    }
}
