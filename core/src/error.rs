use lens_proto::{ErrorCode, WireError};
use thiserror::Error;

/// Errors raised while executing a single operation invocation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("resolver error: {0}")]
    Resolver(#[from] anyhow::Error),
    #[error("plugin vetoed the operation")]
    Vetoed,
    #[error("operation timed out")]
    Timeout,
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::InvalidInput(_) => ErrorCode::InvalidInput,
            EngineError::Resolver(_) | EngineError::Vetoed => ErrorCode::ExecutionError,
            EngineError::Timeout => ErrorCode::Timeout,
        }
    }
}

/// Errors raised by subscription bookkeeping (reactor-level, not per-emit).
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("subscription not found")]
    NotFound,
    #[error("subscription limit reached")]
    LimitReached,
}

/// Errors raised by the operation log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Sanitize an error for wire delivery: multi-line, file-path-like, or
/// over-long messages collapse to a generic string. The
/// full error is expected to already have been logged by the caller via
/// `tracing::error!` before this is called.
pub fn sanitize_for_wire(err: &EngineError, development: bool) -> WireError {
    let code = err.code();
    if development {
        return WireError::new(code, err.to_string());
    }
    let message = err.to_string();
    let looks_unsafe = message.contains('\n') || message.contains('/') || message.contains('\\') || message.len() > 200;
    let safe_message = if looks_unsafe { generic_message(code) } else { message };
    WireError::new(code, safe_message)
}

fn generic_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::NotFound => "operation not found",
        ErrorCode::InvalidInput => "invalid input",
        ErrorCode::ExecutionError => "execution failed",
        ErrorCode::SubscriptionLimit => "subscription limit reached",
        ErrorCode::RateLimited => "rate limited",
        ErrorCode::MessageTooLarge => "message too large",
        ErrorCode::ReconnectError => "reconnect failed",
        ErrorCode::InternalError => "internal error",
        ErrorCode::Timeout => "operation timed out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_message_is_collapsed() {
        let err = EngineError::Resolver(anyhow::anyhow!("boom\nat /usr/lib/resolver.rs:42"));
        let wire = sanitize_for_wire(&err, false);
        assert_eq!(wire.message, generic_message(ErrorCode::ExecutionError));
    }

    #[test]
    fn short_safe_message_passes_through() {
        let err = EngineError::NotFound("user.get".into());
        let wire = sanitize_for_wire(&err, false);
        assert_eq!(wire.message, "operation not found: user.get");
    }

    #[test]
    fn development_mode_bypasses_sanitization() {
        let err = EngineError::Resolver(anyhow::anyhow!("boom\nat /usr/lib/resolver.rs:42"));
        let wire = sanitize_for_wire(&err, true);
        assert!(wire.message.contains("resolver.rs"));
    }
}
