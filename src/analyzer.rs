//! Output analysis: classify what a supervised agent is doing from the text it
//! printed and, optionally, how its process exited.
//!
//! The analyzer is a pure function of its inputs. Four independent detectors
//! (completion, error, waiting, idle) run over the output, then a fixed
//! priority list decides the conclusion. The first branch that applies wins.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::patterns::{
    self, CompletionKind, ErrorType, WaitingKind, CLI_EXITED, COMPLETION_RULES, ERROR_PRIORITY,
    ERROR_RULES, IDLE_TAIL_LINES, MAX_STACK_FRAMES, SESSION_ENDED, SHELL_PROMPT, STACK_FRAME,
    WAITING_RULES,
};

/// Confidence below which no automatic action is recommended
pub const ACTION_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Default iteration cap used when the caller does not provide one
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// What the analyzer believes the session is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    TaskComplete,
    Incomplete,
    StuckOrError,
    WaitingInput,
    MaxIterations,
    Unknown,
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskComplete => "TASK_COMPLETE",
            Self::Incomplete => "INCOMPLETE",
            Self::StuckOrError => "STUCK_OR_ERROR",
            Self::WaitingInput => "WAITING_INPUT",
            Self::MaxIterations => "MAX_ITERATIONS",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// The next step the orchestration layer should take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InjectPrompt,
    AssignNextTask,
    RetryWithHints,
    NotifyOwner,
    NoAction,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InjectPrompt => "inject_prompt",
            Self::AssignNextTask => "assign_next_task",
            Self::RetryWithHints => "retry_with_hints",
            Self::NotifyOwner => "notify_owner",
            Self::NoAction => "no_action",
        };
        f.write_str(s)
    }
}

/// Completion evidence found in the output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionSignals {
    pub task_complete: bool,
    pub tests_passed: bool,
    pub build_succeeded: bool,
    pub commit_made: bool,
    pub pr_created: bool,
    pub explicit_done: bool,
}

impl CompletionSignals {
    /// Whether the agent explicitly declared the task finished
    pub fn has_marker(&self) -> bool {
        self.task_complete || self.explicit_done
    }
}

/// The first error found in the output, by category priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub error_type: ErrorType,
    /// The matching line with one line of context on each side
    pub error_message: String,
    pub stack_trace: Vec<String>,
    pub suggested_fix: String,
}

/// Ways the agent may be blocked on something outside itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitingSignals {
    pub input: bool,
    pub approval: bool,
    pub question: bool,
    pub other_agent: bool,
}

impl WaitingSignals {
    /// Human-readable reason, preferring input, then approval, then another
    /// agent, then an open question
    pub fn reason(&self) -> Option<&'static str> {
        if self.input {
            Some("is waiting for input")
        } else if self.approval {
            Some("is waiting for approval")
        } else if self.other_agent {
            Some("is waiting for another agent")
        } else if self.question {
            Some("asked a question")
        } else {
            None
        }
    }
}

/// Caller-supplied facts about the session being analyzed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisContext {
    pub current_task: Option<String>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub exit_code: Option<i32>,
}

impl Default for AnalysisContext {
    fn default() -> Self {
        Self {
            current_task: None,
            iterations: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            exit_code: None,
        }
    }
}

/// The analyzer's verdict on a session's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateAnalysis {
    pub conclusion: Conclusion,
    pub confidence: f64,
    /// Why the conclusion was reached, in decision order
    pub evidence: Vec<String>,
    pub recommendation: Recommendation,
    pub iterations: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Set when the conclusion was driven by an error pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSignal>,
}

/// Anything that can turn session output into an [`AgentStateAnalysis`]
pub trait StateAnalyzer: Send + Sync {
    /// Classify `output` for `session_name`
    fn analyze(
        &self,
        session_name: &str,
        output: &str,
        context: &AnalysisContext,
    ) -> Result<AgentStateAnalysis>;
}

/// Pattern-based analyzer over raw terminal text
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputAnalyzer;

impl OutputAnalyzer {
    /// Create a new OutputAnalyzer
    pub fn new() -> Self {
        Self
    }

    /// Classify the output. Infallible; [`StateAnalyzer::analyze`] wraps this.
    pub fn classify(
        &self,
        session_name: &str,
        output: &str,
        context: &AnalysisContext,
    ) -> AgentStateAnalysis {
        let text = patterns::strip_ansi(output);

        let completion = detect_completion(&text);
        let error = detect_error(&text);
        let waiting = detect_waiting(&text);
        let idle = detect_idle(&text);

        let verdict = decide(context, &completion, error, &waiting, idle);
        let Verdict {
            conclusion,
            confidence,
            mut evidence,
            mut recommendation,
            error,
        } = verdict;

        if confidence < ACTION_CONFIDENCE_THRESHOLD && recommendation != Recommendation::NoAction {
            evidence.push(format!(
                "Confidence {:.2} is below the action threshold {:.2}; no automatic action",
                confidence, ACTION_CONFIDENCE_THRESHOLD
            ));
            recommendation = Recommendation::NoAction;
        }

        debug!(
            "Analyzed {}: {} ({:.2}) -> {}",
            session_name, conclusion, confidence, recommendation
        );

        AgentStateAnalysis {
            conclusion,
            confidence,
            evidence,
            recommendation,
            iterations: context.iterations,
            max_iterations: context.max_iterations,
            current_task: context.current_task.clone(),
            error,
        }
    }
}

impl StateAnalyzer for OutputAnalyzer {
    fn analyze(
        &self,
        session_name: &str,
        output: &str,
        context: &AnalysisContext,
    ) -> Result<AgentStateAnalysis> {
        Ok(self.classify(session_name, output, context))
    }
}

struct Verdict {
    conclusion: Conclusion,
    confidence: f64,
    evidence: Vec<String>,
    recommendation: Recommendation,
    error: Option<ErrorSignal>,
}

impl Verdict {
    fn new(
        conclusion: Conclusion,
        confidence: f64,
        recommendation: Recommendation,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            conclusion,
            confidence,
            evidence,
            recommendation,
            error: None,
        }
    }
}

fn decide(
    context: &AnalysisContext,
    completion: &CompletionSignals,
    error: Option<ErrorSignal>,
    waiting: &WaitingSignals,
    idle: bool,
) -> Verdict {
    use Conclusion::{Incomplete, MaxIterations, StuckOrError, TaskComplete, Unknown, WaitingInput};
    use Recommendation::{AssignNextTask, InjectPrompt, NoAction, NotifyOwner, RetryWithHints};

    if context.iterations >= context.max_iterations {
        return Verdict::new(
            MaxIterations,
            1.0,
            NotifyOwner,
            vec![format!(
                "Reached iteration limit ({}/{})",
                context.iterations, context.max_iterations
            )],
        );
    }

    if completion.has_marker() {
        let mut evidence = Vec::new();
        if completion.task_complete {
            evidence.push("Task completion marker found".to_string());
        }
        if completion.explicit_done {
            evidence.push("Agent stated the work is done".to_string());
        }
        return Verdict::new(TaskComplete, 0.95, AssignNextTask, evidence);
    }

    if completion.tests_passed && completion.build_succeeded {
        let mut evidence = vec![
            "All tests passed".to_string(),
            "Build succeeded".to_string(),
        ];
        if completion.commit_made {
            evidence.push("Changes were committed".to_string());
            if completion.pr_created {
                evidence.push("Pull request created".to_string());
            }
            return Verdict::new(TaskComplete, 0.85, AssignNextTask, evidence);
        }
        evidence.push("No commit detected".to_string());
        return Verdict::new(Incomplete, 0.7, InjectPrompt, evidence);
    }

    if let Some(error) = error {
        let mut evidence = vec![format!("Detected {} error", error.error_type)];
        if let Some(first) = error.error_message.lines().find(|l| !l.trim().is_empty()) {
            evidence.push(format!("Error: {}", first.trim()));
        }
        evidence.push(format!("Suggested fix: {}", error.suggested_fix));
        let mut verdict = Verdict::new(StuckOrError, 0.8, RetryWithHints, evidence);
        verdict.error = Some(error);
        return verdict;
    }

    if waiting.input || waiting.question {
        let reason = waiting.reason().unwrap_or("is waiting for input");
        return Verdict::new(
            WaitingInput,
            0.75,
            NotifyOwner,
            vec![format!("Agent {}", reason)],
        );
    }

    if waiting.approval {
        return Verdict::new(
            WaitingInput,
            0.8,
            NotifyOwner,
            vec!["Agent is waiting for approval".to_string()],
        );
    }

    if waiting.other_agent {
        return Verdict::new(
            WaitingInput,
            0.7,
            NoAction,
            vec!["Agent is waiting for another agent; not interrupting".to_string()],
        );
    }

    if idle {
        return Verdict::new(
            Incomplete,
            0.6,
            InjectPrompt,
            vec!["Session is idle at a prompt".to_string()],
        );
    }

    match context.exit_code {
        Some(0) => Verdict::new(
            Incomplete,
            0.5,
            InjectPrompt,
            vec!["Process exited cleanly without signalling completion".to_string()],
        ),
        Some(code) => Verdict::new(
            StuckOrError,
            0.7,
            RetryWithHints,
            vec![format!("Process exited with code {}", code)],
        ),
        None => Verdict::new(
            Unknown,
            0.5,
            NoAction,
            vec!["No recognizable state in output".to_string()],
        ),
    }
}

/// Detect completion evidence anywhere in the output
pub fn detect_completion(text: &str) -> CompletionSignals {
    let mut signals = CompletionSignals::default();
    for rule in COMPLETION_RULES.iter() {
        if !rule.regex.is_match(text) {
            continue;
        }
        match rule.kind {
            CompletionKind::TaskComplete => signals.task_complete = true,
            CompletionKind::TestsPassed => signals.tests_passed = true,
            CompletionKind::BuildSucceeded => signals.build_succeeded = true,
            CompletionKind::CommitMade => signals.commit_made = true,
            CompletionKind::PrCreated => signals.pr_created = true,
            CompletionKind::ExplicitDone => signals.explicit_done = true,
        }
    }
    signals
}

/// Find the first error, trying categories in [`ERROR_PRIORITY`] order
pub fn detect_error(text: &str) -> Option<ErrorSignal> {
    let lines: Vec<&str> = text.lines().collect();

    for error_type in ERROR_PRIORITY {
        let category: Vec<_> = ERROR_RULES
            .iter()
            .filter(|rule| rule.kind == error_type)
            .collect();

        let Some(index) = lines
            .iter()
            .position(|line| category.iter().any(|rule| rule.regex.is_match(line)))
        else {
            continue;
        };

        let start = index.saturating_sub(1);
        let end = (index + 2).min(lines.len());
        let error_message = lines[start..end].join("\n");

        let stack_trace = lines
            .iter()
            .filter(|line| STACK_FRAME.is_match(line))
            .take(MAX_STACK_FRAMES)
            .map(|line| line.trim().to_string())
            .collect();

        let suggested_fix = patterns::suggest_fix(error_type, &error_message).to_string();

        return Some(ErrorSignal {
            error_type,
            error_message,
            stack_trace,
            suggested_fix,
        });
    }

    None
}

/// Detect whether the agent is blocked on a person or another agent
pub fn detect_waiting(text: &str) -> WaitingSignals {
    let mut signals = WaitingSignals::default();
    for rule in WAITING_RULES.iter() {
        if !rule.regex.is_match(text) {
            continue;
        }
        match rule.kind {
            WaitingKind::Input => signals.input = true,
            WaitingKind::Approval => signals.approval = true,
            WaitingKind::Question => signals.question = true,
            WaitingKind::OtherAgent => signals.other_agent = true,
        }
    }
    signals
}

/// Detect an idle session. Prompt detection only looks at the last few lines
/// so an old prompt earlier in the scrollback does not count.
pub fn detect_idle(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().collect();
    let tail = &lines[lines.len().saturating_sub(IDLE_TAIL_LINES)..];

    tail.iter().any(|line| SHELL_PROMPT.is_match(line))
        || CLI_EXITED.is_match(text)
        || SESSION_ENDED.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(output: &str) -> AgentStateAnalysis {
        OutputAnalyzer::new().classify("test-session", output, &AnalysisContext::default())
    }

    fn analyze_with(output: &str, context: AnalysisContext) -> AgentStateAnalysis {
        OutputAnalyzer::new().classify("test-session", output, &context)
    }

    #[test]
    fn test_completion_marker_means_task_complete() {
        let analysis = analyze("Task completed successfully [complete_task]");
        assert_eq!(analysis.conclusion, Conclusion::TaskComplete);
        assert!(analysis.confidence >= 0.9);
        assert_eq!(analysis.recommendation, Recommendation::AssignNextTask);
    }

    #[test]
    fn test_tests_and_build_without_commit_is_incomplete() {
        let output = "Test Suites: 10 passed, 0 failed\nwebpack compiled successfully\n";
        let analysis = analyze(output);
        assert_eq!(analysis.conclusion, Conclusion::Incomplete);
        assert_eq!(analysis.confidence, 0.7);
        assert_eq!(analysis.recommendation, Recommendation::InjectPrompt);
        assert!(analysis.evidence.iter().any(|e| e.contains("No commit")));
    }

    #[test]
    fn test_tests_build_and_commit_is_complete() {
        let output = "Test Suites: 4 passed, 4 total\n\
                      webpack compiled successfully\n\
                      [feature/login 9c1d2e3] Add login form\n";
        let analysis = analyze(output);
        assert_eq!(analysis.conclusion, Conclusion::TaskComplete);
        assert_eq!(analysis.confidence, 0.85);
        assert_eq!(analysis.recommendation, Recommendation::AssignNextTask);
    }

    #[test]
    fn test_typescript_error_is_compile_error() {
        let analysis = analyze("src/app.ts(3,5): error TS2339: Property 'foo' does not exist on type 'Bar'.");
        assert_eq!(analysis.conclusion, Conclusion::StuckOrError);
        assert_eq!(analysis.recommendation, Recommendation::RetryWithHints);
        let error = analysis.error.unwrap();
        assert_eq!(error.error_type, ErrorType::Compile);
        assert!(error.suggested_fix.contains("property"));
    }

    #[test]
    fn test_iteration_limit_overrides_everything() {
        let context = AnalysisContext {
            iterations: 10,
            max_iterations: 10,
            ..AnalysisContext::default()
        };
        let analysis = analyze_with("Task completed successfully [complete_task]", context);
        assert_eq!(analysis.conclusion, Conclusion::MaxIterations);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.recommendation, Recommendation::NotifyOwner);
        assert_eq!(analysis.iterations, 10);
        assert_eq!(analysis.max_iterations, 10);
    }

    #[test]
    fn test_empty_output_is_unknown() {
        let analysis = analyze("");
        assert_eq!(analysis.conclusion, Conclusion::Unknown);
        assert_eq!(analysis.recommendation, Recommendation::NoAction);
    }

    #[test]
    fn test_completion_wins_over_error() {
        let output = "error TS2339: Property 'foo' does not exist\n...\nAll tasks are done.\n[complete_task]";
        assert_eq!(analyze(output).conclusion, Conclusion::TaskComplete);
    }

    #[test]
    fn test_progress_message_is_not_task_complete() {
        let analysis = analyze("I've completed the first step, moving on to the next");
        assert_ne!(analysis.conclusion, Conclusion::TaskComplete);
        assert_ne!(analysis.recommendation, Recommendation::AssignNextTask);

        let output = "I've completed the first step\nerror TS2304: Cannot find name 'foo'.";
        let analysis = analyze(output);
        assert_eq!(analysis.conclusion, Conclusion::StuckOrError);
        assert_eq!(analysis.error.unwrap().error_type, ErrorType::Compile);
    }

    #[test]
    fn test_failing_tests_are_an_error_not_partial_completion() {
        let output = "FAIL src/login.test.ts\nTests: 2 failed, 8 passed, 10 total\n";
        let analysis = analyze(output);
        assert_eq!(analysis.conclusion, Conclusion::StuckOrError);
        assert_eq!(analysis.error.unwrap().error_type, ErrorType::Test);
    }

    #[test]
    fn test_permission_checked_before_runtime() {
        let analysis = analyze("Error: EACCES: permission denied, open '/usr/lib/node_modules'");
        let error = analysis.error.unwrap();
        assert_eq!(error.error_type, ErrorType::Permission);
        assert!(error.suggested_fix.contains("permissions"));
    }

    #[test]
    fn test_error_context_and_stack_trace_are_extracted() {
        let output = "running server\n\
                      TypeError: Cannot read properties of undefined (reading 'id')\n\
                      \x20   at getUser (/app/src/users.js:12:18)\n\
                      \x20   at main (/app/src/index.js:4:3)\n";
        let error = analyze(output).error.unwrap();
        assert_eq!(error.error_type, ErrorType::Runtime);
        assert_eq!(error.error_message.lines().count(), 3);
        assert!(error.error_message.starts_with("running server"));
        assert_eq!(
            error.stack_trace,
            vec![
                "at getUser (/app/src/users.js:12:18)".to_string(),
                "at main (/app/src/index.js:4:3)".to_string(),
            ]
        );
    }

    #[test]
    fn test_stack_trace_is_capped() {
        let mut output = String::from("Error: boom\n");
        for i in 0..15 {
            output.push_str(&format!("    at frame{} (/app/f.js:{}:1)\n", i, i + 1));
        }
        let error = analyze(&output).error.unwrap();
        assert_eq!(error.stack_trace.len(), MAX_STACK_FRAMES);
    }

    #[test]
    fn test_question_waits_for_owner() {
        let analysis = analyze("I found two config files. Which one should I update?");
        assert_eq!(analysis.conclusion, Conclusion::WaitingInput);
        assert_eq!(analysis.confidence, 0.75);
        assert_eq!(analysis.recommendation, Recommendation::NotifyOwner);
    }

    #[test]
    fn test_approval_waits_for_owner() {
        let analysis = analyze("Here is the migration plan.\nWaiting for approval before applying.");
        assert_eq!(analysis.conclusion, Conclusion::WaitingInput);
        assert_eq!(analysis.confidence, 0.8);
        assert_eq!(analysis.recommendation, Recommendation::NotifyOwner);
    }

    #[test]
    fn test_waiting_on_other_agent_is_left_alone() {
        let analysis = analyze("Schema changes pending. Waiting for another agent to finish the API.");
        assert_eq!(analysis.conclusion, Conclusion::WaitingInput);
        assert_eq!(analysis.confidence, 0.7);
        assert_eq!(analysis.recommendation, Recommendation::NoAction);
    }

    #[test]
    fn test_waiting_reason_priority() {
        let signals = WaitingSignals {
            input: false,
            approval: true,
            question: true,
            other_agent: true,
        };
        assert_eq!(signals.reason(), Some("is waiting for approval"));
    }

    #[test]
    fn test_idle_prompt_in_tail_is_incomplete() {
        let analysis = analyze("Edited 3 files\nuser@box:~/app$ ");
        assert_eq!(analysis.conclusion, Conclusion::Incomplete);
        assert_eq!(analysis.confidence, 0.6);
        assert_eq!(analysis.recommendation, Recommendation::InjectPrompt);
    }

    #[test]
    fn test_idle_prompt_outside_tail_is_ignored() {
        let mut output = String::from("user@box:~/app$\n");
        for i in 0..IDLE_TAIL_LINES {
            output.push_str(&format!("compiling module {}\n", i));
        }
        assert!(!detect_idle(&output));
        assert_eq!(analyze(&output).conclusion, Conclusion::Unknown);
    }

    #[test]
    fn test_download_progress_is_not_idle() {
        let output = "Downloading deps\n100%";
        assert!(!detect_idle(output));
        assert_eq!(analyze(output).conclusion, Conclusion::Unknown);
    }

    #[test]
    fn test_session_end_is_idle_anywhere() {
        let mut output = String::from("Session ended.\n");
        for i in 0..20 {
            output.push_str(&format!("line {}\n", i));
        }
        assert!(detect_idle(&output));
    }

    #[test]
    fn test_clean_exit_is_gated_below_threshold() {
        let context = AnalysisContext {
            exit_code: Some(0),
            ..AnalysisContext::default()
        };
        let analysis = analyze_with("writing files", context);
        assert_eq!(analysis.conclusion, Conclusion::Incomplete);
        assert_eq!(analysis.confidence, 0.5);
        assert_eq!(analysis.recommendation, Recommendation::NoAction);
    }

    #[test]
    fn test_nonzero_exit_is_stuck() {
        let context = AnalysisContext {
            exit_code: Some(137),
            ..AnalysisContext::default()
        };
        let analysis = analyze_with("writing files", context);
        assert_eq!(analysis.conclusion, Conclusion::StuckOrError);
        assert_eq!(analysis.confidence, 0.7);
        assert_eq!(analysis.recommendation, Recommendation::RetryWithHints);
    }

    #[test]
    fn test_ansi_codes_do_not_hide_markers() {
        let analysis = analyze("\x1b[1m\x1b[32mTask completed\x1b[0m [complete_task]\r\n");
        assert_eq!(analysis.conclusion, Conclusion::TaskComplete);
    }

    #[test]
    fn test_current_task_is_attached() {
        let context = AnalysisContext {
            current_task: Some("Add login form".to_string()),
            iterations: 3,
            ..AnalysisContext::default()
        };
        let analysis = analyze_with("", context);
        assert_eq!(analysis.current_task.as_deref(), Some("Add login form"));
        assert_eq!(analysis.iterations, 3);
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let output = "FAIL src/a.test.ts\n    at x (/a.js:1:2)\nShould I continue?";
        assert_eq!(analyze(output), analyze(output));
    }
}
