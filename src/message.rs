//! Text returned to the orchestration layer with each dispatched action.

use crate::analyzer::{AgentStateAnalysis, Recommendation};
use crate::config::PromptTemplates;

/// Build the message for a dispatched action
pub fn compose(
    session_name: &str,
    action: Recommendation,
    analysis: &AgentStateAnalysis,
    prompts: &PromptTemplates,
) -> String {
    match action {
        Recommendation::InjectPrompt => match &analysis.current_task {
            Some(task) => format!("{}\n\nCurrent task: {}", prompts.continue_prompt, task),
            None => prompts.continue_prompt.clone(),
        },
        Recommendation::RetryWithHints => retry_message(analysis, prompts),
        Recommendation::AssignNextTask => match &analysis.current_task {
            Some(task) => format!("Task '{}' complete; ready for next assignment", task),
            None => "Task complete; ready for next assignment".to_string(),
        },
        Recommendation::NotifyOwner => notification_message(session_name, analysis),
        Recommendation::NoAction => format!("No action taken ({})", analysis.conclusion),
    }
}

/// Message shown to a session's owner
pub fn notification_message(session_name: &str, analysis: &AgentStateAnalysis) -> String {
    let mut message = format!(
        "Session '{}' needs attention: {}",
        session_name, analysis.conclusion
    );
    if !analysis.evidence.is_empty() {
        message.push_str(" - ");
        message.push_str(&analysis.evidence.join("; "));
    }
    message
}

/// Message shown when a finished task needs a human to approve the next one
pub fn approval_message(session_name: &str, analysis: &AgentStateAnalysis) -> String {
    let task = match &analysis.current_task {
        Some(task) => format!("'{}'", task),
        None => "its task".to_string(),
    };
    let mut message = format!(
        "Session '{}' finished {} and is waiting for approval before the next assignment",
        session_name, task
    );
    if !analysis.evidence.is_empty() {
        message.push_str(" - ");
        message.push_str(&analysis.evidence.join("; "));
    }
    message
}

fn retry_message(analysis: &AgentStateAnalysis, prompts: &PromptTemplates) -> String {
    let mut message = prompts.retry_prompt.clone();
    match &analysis.error {
        Some(error) => {
            message.push_str(&format!(
                "\n\nError type: {}\n{}",
                error.error_type, error.error_message
            ));
            if !error.stack_trace.is_empty() {
                message.push_str("\n\nStack trace:\n");
                message.push_str(&error.stack_trace.join("\n"));
            }
            message.push_str(&format!("\n\nSuggested fix: {}", error.suggested_fix));
        }
        None => {
            for line in &analysis.evidence {
                message.push_str("\n- ");
                message.push_str(line);
            }
        }
    }
    message
}
