//! Normalized error objects attached to task results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What kind of failure produced an [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An error returned from a hook or test body.
    Thrown,
    /// A failed assertion, possibly with expected/actual values.
    Assertion,
    /// A panic caught inside a hook or test body.
    Panic,
    /// A hook or test body exceeded its configured timeout.
    Timeout,
    /// The observed assertion count differs from the declared one.
    AssertionCount,
    /// At least one assertion was required and none was recorded.
    MissingAssertions,
    /// A test marked as failing passed.
    UnexpectedPass,
    /// A suite in run mode contains no tests.
    EmptySuite,
    /// The file could not be collected.
    Collection,
}

/// Error attached to a terminal task result, ready for direct reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: "Error".to_string(),
            message: message.into(),
            expected: None,
            actual: None,
            diff: None,
            stack: None,
        }
    }

    /// Builder method to set the error name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to attach causal context.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach expected/actual values and a line diff between them.
    pub fn with_comparison(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        let expected = expected.into();
        let actual = actual.into();
        self.diff = Some(line_diff(&expected, &actual));
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    /// A test marked `fails` completed without error.
    pub fn unexpected_pass() -> Self {
        Self::new(ErrorKind::UnexpectedPass, "Expect test to fail")
    }

    /// A run-mode suite without any test.
    pub fn empty_suite(suite_name: &str) -> Self {
        Self::new(
            ErrorKind::EmptySuite,
            format!("No tests found in suite {suite_name}"),
        )
    }

    /// Observed assertion count differs from the declared count.
    pub fn assertion_count(expected: u32, actual: u32) -> Self {
        Self::new(
            ErrorKind::AssertionCount,
            format!("expected number of assertions to be {expected}, but got {actual}"),
        )
        .with_name("AssertionError")
        .with_comparison(expected.to_string(), actual.to_string())
    }

    /// `has_assertions` was requested but nothing was asserted.
    pub fn missing_assertions() -> Self {
        Self::new(
            ErrorKind::MissingAssertions,
            "expected any number of assertion, but got none",
        )
        .with_name("AssertionError")
    }

    /// A hook or body did not finish within `limit`.
    pub fn timeout(what: &str, limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{what} timed out in {}ms", limit.as_millis()),
        )
        .with_name("TimeoutError")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

fn line_diff(expected: &str, actual: &str) -> String {
    let mut out = String::from("- Expected\n+ Received\n");
    let expected_lines: Vec<&str> = expected.lines().collect();
    let actual_lines: Vec<&str> = actual.lines().collect();
    let len = expected_lines.len().max(actual_lines.len());
    for i in 0..len {
        match (expected_lines.get(i), actual_lines.get(i)) {
            (Some(e), Some(a)) if e == a => {
                out.push_str("  ");
                out.push_str(e);
                out.push('\n');
            }
            (e, a) => {
                if let Some(e) = e {
                    out.push_str("- ");
                    out.push_str(e);
                    out.push('\n');
                }
                if let Some(a) = a {
                    out.push_str("+ ");
                    out.push_str(a);
                    out.push('\n');
                }
            }
        }
    }
    out
}
