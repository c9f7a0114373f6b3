//! Text-matching rules used to classify raw terminal output.
//!
//! Every rule set here is immutable and compiled once on first use. The
//! analyzer decides what the matches mean; this module only knows how to
//! recognize them.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of trailing lines inspected for an idle shell prompt
pub const IDLE_TAIL_LINES: usize = 10;

/// Maximum number of stack frames kept from an error
pub const MAX_STACK_FRAMES: usize = 10;

/// Kinds of completion evidence an agent can leave in its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    /// An explicit task-complete marker such as `[complete_task]`
    TaskComplete,
    /// A test runner summary where nothing failed
    TestsPassed,
    /// A build tool reporting success
    BuildSucceeded,
    /// `git commit` output
    CommitMade,
    /// A pull request URL or creation message
    PrCreated,
    /// Plain-language "all done" phrasing
    ExplicitDone,
}

/// Category of a detected error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Compile,
    Test,
    Permission,
    Runtime,
}

impl ErrorType {
    /// Remediation hint used when no message-specific override applies
    pub fn default_fix(self) -> &'static str {
        match self {
            Self::Compile => "Fix the compilation errors reported above and rebuild",
            Self::Test => "Review the failing test output, fix the code or the test, then re-run the suite",
            Self::Permission => "Check file permissions or run the command with the required access",
            Self::Runtime => "Inspect the error and stack trace, then fix the failing code path",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "compile"),
            Self::Test => write!(f, "test"),
            Self::Permission => write!(f, "permission"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Order in which error categories are tried; the first category with a
/// matching line wins. Permission precedes runtime because permission
/// failures are usually printed as generic `Error: ...` lines too.
pub const ERROR_PRIORITY: [ErrorType; 4] = [
    ErrorType::Compile,
    ErrorType::Test,
    ErrorType::Permission,
    ErrorType::Runtime,
];

/// Reasons an agent may be blocked on something outside itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitingKind {
    Input,
    Approval,
    Question,
    OtherAgent,
}

/// A compiled rule tagged with the category it signals
pub struct Rule<K> {
    pub kind: K,
    pub regex: Regex,
}

fn rules<K: Copy>(table: &[(K, &str)]) -> Vec<Rule<K>> {
    table
        .iter()
        .map(|&(kind, pattern)| Rule {
            kind,
            regex: Regex::new(pattern).expect("Invalid built-in pattern"),
        })
        .collect()
}

/// Completion rules, matched against the whole output
pub static COMPLETION_RULES: LazyLock<Vec<Rule<CompletionKind>>> = LazyLock::new(|| {
    use CompletionKind::{
        BuildSucceeded, CommitMade, ExplicitDone, PrCreated, TaskComplete, TestsPassed,
    };
    rules(&[
        (TaskComplete, r"\[complete_task\]"),
        (TaskComplete, r"(?i)\btask[_ ]completed?\b"),
        (TaskComplete, r"(?i)\btask (?:has been )?marked (?:as )?(?:complete|done)\b"),
        (TestsPassed, r"(?im)^\s*tests?(?: suites)?:\s+\d+ passed(?:,\s+0 failed)?(?:,\s+\d+ total)?\s*$"),
        (TestsPassed, r"(?i)\ball tests (?:have )?passed\b"),
        (TestsPassed, r"(?m)^test result: ok\."),
        (TestsPassed, r"(?m)^=+ \d+ passed in [\d.]+s =+$"),
        (BuildSucceeded, r"(?i)\bwebpack compiled successfully\b"),
        (BuildSucceeded, r"(?i)\bbuild (?:succeeded|successful|completed successfully)\b"),
        (BuildSucceeded, r"(?i)\bsuccessfully built\b"),
        (BuildSucceeded, r"(?m)^\s*Finished .*target\(s\) in "),
        (BuildSucceeded, r"(?i)\bbuilt in [\d.]+m?s\b"),
        (CommitMade, r"(?m)^\[[\w./-]+(?: \(root-commit\))? [0-9a-f]{7,40}\] "),
        (CommitMade, r"(?i)\bcommitted (?:the )?(?:changes|successfully)\b"),
        (CommitMade, r"(?i)\bcreated commit [0-9a-f]{7,40}\b"),
        (PrCreated, r"https://github\.com/[\w.-]+/[\w.-]+/pull/\d+"),
        (PrCreated, r"(?i)\b(?:pull request|PR) (?:#\d+ )?(?:created|opened)\b"),
        (ExplicitDone, r"(?i)\ball (?:tasks|work) (?:are |is )?(?:done|complete|completed|finished)\b"),
        (
            ExplicitDone,
            r"(?i)\bi(?: have|'ve) (?:finished|completed) (?:(?:the|this) task|all (?:the )?(?:tasks|work))\b",
        ),
        (ExplicitDone, r"(?im)^\s*done[.!]?\s*$"),
    ])
});

/// Error rules, matched line by line so a context window can be cut around
/// the first hit
pub static ERROR_RULES: LazyLock<Vec<Rule<ErrorType>>> = LazyLock::new(|| {
    use ErrorType::{Compile, Permission, Runtime, Test};
    rules(&[
        (Compile, r"\berror TS\d+:"),
        (Compile, r"^\s*error\[E\d{4}\]"),
        (Compile, r"\bSyntaxError\b"),
        (Compile, r"(?i)\b(?:compilation failed|failed to compile|could not compile)\b"),
        (Test, r"(?i)\btests? failed\b"),
        (Test, r"(?i)^\s*tests?(?: suites)?:\s+.*\b[1-9]\d* failed\b"),
        (Test, r"^\s*FAIL\s+\S+"),
        (Test, r"^\s*✕ "),
        (Test, r"\bAssertionError\b"),
        (Test, r"^test result: FAILED"),
        (Test, r"^=+ .*\b[1-9]\d* failed"),
        (Permission, r"(?i)\bpermission denied\b"),
        (Permission, r"\bEACCES\b"),
        (Permission, r"\bEPERM\b"),
        (Permission, r"(?i)\boperation not permitted\b"),
        (Runtime, r"^\s*(?:Uncaught )?[A-Z]?\w*Error: "),
        (Runtime, r"(?i)\bunhandled (?:promise )?rejection\b"),
        (Runtime, r"\bENOENT\b"),
        (Runtime, r"(?i)\bsegmentation fault\b"),
        (Runtime, r"^thread '.*' panicked at"),
        (Runtime, r"^Traceback \(most recent call last\):"),
    ])
});

/// Waiting rules, matched against the whole output
pub static WAITING_RULES: LazyLock<Vec<Rule<WaitingKind>>> = LazyLock::new(|| {
    use WaitingKind::{Approval, Input, OtherAgent, Question};
    rules(&[
        (Input, r"(?i)\bwaiting for (?:your |user )?input\b"),
        (Input, r"(?i)\bpress enter to continue\b"),
        (Input, r"(?i)\bplease (?:provide|enter|type)\b"),
        (Approval, r"(?i)\bwaiting for (?:your )?(?:approval|confirmation|review)\b"),
        (Approval, r"(?i)\bdo you want to (?:proceed|continue)\b"),
        (Approval, r"(?i)\((?:y/n|yes/no)\)|\[y/n\]"),
        (Approval, r"(?i)\bapprove (?:this|the) (?:plan|change|changes)\b"),
        (Question, r"\?\s*\z"),
        (OtherAgent, r"(?i)\bwaiting (?:for|on) (?:another|the other|other) agents?\b"),
        (OtherAgent, r"(?i)\bblocked (?:by|on) (?:another agent|agent|dependency)\b"),
        (OtherAgent, r"(?i)\bwaiting for (?:the )?(?:dependency|upstream task)\b"),
    ])
});

/// A bare shell or agent prompt on its own line. A `%` prompt needs a
/// non-digit before it so progress lines like `100%` do not count.
pub static SHELL_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[\w.@:~/()-]*\s?[$#>❯]|(?:[\w.@:~/()-]*[^\d\s])?\s?%)\s*$")
        .expect("Invalid shell prompt pattern")
});

/// The agent CLI reporting that it exited
pub static CLI_EXITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:claude|codex|gemini|agent|cli) (?:has )?exited\b|\bprocess exited with (?:code|status)\b",
    )
    .expect("Invalid CLI exit pattern")
});

/// The terminal session ending
pub static SESSION_ENDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bsession (?:has )?(?:ended|terminated|closed)\b|\bgoodbye!?\s*\z")
        .expect("Invalid session end pattern")
});

/// A JavaScript-style stack frame: `at fn (file:line:col)`
pub static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at .*\(.+:\d+:\d+\)\s*$").expect("Invalid stack frame pattern")
});

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]|\r")
        .expect("Invalid ANSI escape pattern")
});

/// Message-specific remediation hints, checked in order against the
/// lowercased error message before falling back to the category default
const FIX_OVERRIDES: &[(&str, &str)] = &[
    (
        "cannot find module",
        "Install the missing dependencies (e.g. `npm install`) and check the import path",
    ),
    ("eacces", "Fix the file permissions or write to a location you own"),
    ("permission denied", "Fix the file permissions or write to a location you own"),
    ("enoent", "Check that the referenced file or directory path exists"),
    (
        "does not exist on type",
        "Add the missing property to the type definition or correct the property name",
    ),
];

/// Resolve a remediation hint for an error message of the given type
pub fn suggest_fix(error_type: ErrorType, message: &str) -> &'static str {
    let lowered = message.to_lowercase();
    FIX_OVERRIDES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, hint)| *hint)
        .unwrap_or_else(|| error_type.default_fix())
}

/// Remove ANSI escape sequences and carriage returns from terminal text
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds<K: Copy + PartialEq>(rules: &[Rule<K>], text: &str) -> Vec<K> {
        let mut found = Vec::new();
        for rule in rules {
            if rule.regex.is_match(text) && !found.contains(&rule.kind) {
                found.push(rule.kind);
            }
        }
        found
    }

    #[test]
    fn test_all_builtin_patterns_compile() {
        assert!(!COMPLETION_RULES.is_empty());
        assert!(!ERROR_RULES.is_empty());
        assert!(!WAITING_RULES.is_empty());
        LazyLock::force(&SHELL_PROMPT);
        LazyLock::force(&CLI_EXITED);
        LazyLock::force(&SESSION_ENDED);
        LazyLock::force(&STACK_FRAME);
    }

    #[test]
    fn test_error_priority_is_fixed() {
        assert_eq!(
            ERROR_PRIORITY,
            [
                ErrorType::Compile,
                ErrorType::Test,
                ErrorType::Permission,
                ErrorType::Runtime
            ]
        );
    }

    #[test]
    fn test_jest_summary_counts_as_passed_only_without_failures() {
        let passed = kinds(&COMPLETION_RULES, "Test Suites: 10 passed, 0 failed");
        assert!(passed.contains(&CompletionKind::TestsPassed));

        let failed = kinds(&COMPLETION_RULES, "Tests: 2 failed, 10 passed, 12 total");
        assert!(!failed.contains(&CompletionKind::TestsPassed));
    }

    #[test]
    fn test_git_commit_output_is_recognized() {
        let found = kinds(&COMPLETION_RULES, "[main 3f2a9c1] Add login form\n 2 files changed");
        assert_eq!(found, vec![CompletionKind::CommitMade]);
    }

    #[test]
    fn test_permission_text_also_matches_runtime_shape() {
        let found = kinds(&ERROR_RULES, "Error: EACCES: permission denied, open '/etc/x'");
        assert!(found.contains(&ErrorType::Permission));
        assert!(found.contains(&ErrorType::Runtime));
    }

    #[test]
    fn test_question_only_matches_at_end_of_output() {
        let trailing = kinds(&WAITING_RULES, "Should I also update the docs?");
        assert!(trailing.contains(&WaitingKind::Question));
        let earlier = kinds(&WAITING_RULES, "Why? Because.\nDone with step one");
        assert!(!earlier.contains(&WaitingKind::Question));
    }

    #[test]
    fn test_shell_prompt_shapes() {
        assert!(SHELL_PROMPT.is_match("user@host:~/project$ "));
        assert!(SHELL_PROMPT.is_match("❯"));
        assert!(SHELL_PROMPT.is_match("> "));
        assert!(!SHELL_PROMPT.is_match("echo $HOME"));
    }

    #[test]
    fn test_percent_prompt_is_not_a_progress_line() {
        assert!(SHELL_PROMPT.is_match("%"));
        assert!(SHELL_PROMPT.is_match("macbook% "));
        assert!(SHELL_PROMPT.is_match("~/src %"));
        assert!(!SHELL_PROMPT.is_match("100%"));
        assert!(!SHELL_PROMPT.is_match("  42 %"));
    }

    #[test]
    fn test_progress_phrasing_is_not_explicit_done() {
        for text in [
            "I've completed the first step, moving on to the next",
            "I have finished the refactor of the parser",
            "I've completed this part; tests next",
        ] {
            let found = kinds(&COMPLETION_RULES, text);
            assert!(!found.contains(&CompletionKind::ExplicitDone), "{}", text);
        }
        for text in [
            "I've completed the task.",
            "I have finished all the tasks",
            "I've completed all work",
        ] {
            let found = kinds(&COMPLETION_RULES, text);
            assert!(found.contains(&CompletionKind::ExplicitDone), "{}", text);
        }
    }

    #[test]
    fn test_suggest_fix_prefers_message_override() {
        let missing = suggest_fix(ErrorType::Runtime, "Error: Cannot find module 'left-pad'");
        assert!(missing.contains("npm install"));
        assert!(suggest_fix(ErrorType::Runtime, "ENOENT: no such file").contains("path exists"));
        assert_eq!(
            suggest_fix(ErrorType::Test, "AssertionError: expected 1 to equal 2"),
            ErrorType::Test.default_fix()
        );
    }

    #[test]
    fn test_strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[32m✓ done\x1b[0m\r\n"), "✓ done\n");
    }
}
