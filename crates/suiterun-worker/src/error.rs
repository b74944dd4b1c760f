//! Worker errors and normalization of user errors into [`ErrorInfo`].

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

use suiterun_core::{CoreError, ErrorInfo, ErrorKind};
use suiterun_proto::BridgeError;

use crate::context::AssertionError;

/// Errors that end a worker invocation early.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("task tree error: {0}")]
    Core(#[from] CoreError),
}

/// Normalize an error returned by a hook or test body.
pub fn process_error(error: &(dyn StdError + 'static)) -> ErrorInfo {
    if let Some(assertion) = error.downcast_ref::<AssertionError>() {
        let info = ErrorInfo::new(ErrorKind::Assertion, assertion.message.clone())
            .with_name("AssertionError");
        return match (&assertion.expected, &assertion.actual) {
            (Some(expected), Some(actual)) => info.with_comparison(expected.clone(), actual.clone()),
            _ => info,
        };
    }

    let mut info = ErrorInfo::new(ErrorKind::Thrown, error.to_string());
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    if !causes.is_empty() {
        info = info.with_stack(causes.join("\n"));
    }
    info
}

/// Normalize a caught panic payload.
pub fn panic_error(payload: Box<dyn Any + Send>) -> ErrorInfo {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    ErrorInfo::new(ErrorKind::Panic, message).with_name("Panic")
}
