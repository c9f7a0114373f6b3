//! Ralph Supervisor: decides whether a coding agent running in a terminal
//! session has finished, is stuck, is waiting on a human, or should be nudged
//! to continue.
//!
//! This crate classifies raw terminal output and keeps per-session iteration
//! state. It only reports what should happen next; the caller performs the
//! action.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod patterns;
pub mod state;
pub mod supervisor;

pub use analyzer::{
    AgentStateAnalysis, AnalysisContext, Conclusion, OutputAnalyzer, Recommendation, StateAnalyzer,
};
pub use config::{SessionContinuationConfig, SupervisorConfig};
pub use error::{Result, SupervisorError};
pub use event::{ContinuationEvent, ContinuationTrigger, EventSource};
pub use supervisor::{ContinuationResult, ContinuationSupervisor, DispatchedResult};
