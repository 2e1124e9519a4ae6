//! Job failure taxonomy: retryable vs terminal.
//!
//! Handlers return a [`JobError`] built with one of its explicit constructors.
//! Terminal errors render with a sentinel prefix (`CONFIG_MISSING`,
//! `NOT_IMPLEMENTED`, `VALIDATION_ERROR`) so the persisted `last_error` stays
//! readable by anything that inspects job records. Messages that arrive as
//! plain strings are classified with [`is_terminal_error`].

use thiserror::Error;

/// Category of a non-retryable failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    /// Required configuration (credentials, endpoints) is absent.
    ConfigMissing,
    /// The job type has no handler.
    NotImplemented,
    /// The payload or the request it describes is invalid.
    Validation,
}

impl TerminalKind {
    pub const ALL: [TerminalKind; 3] = [
        TerminalKind::ConfigMissing,
        TerminalKind::NotImplemented,
        TerminalKind::Validation,
    ];

    /// Sentinel prefix used in persisted error messages.
    pub fn prefix(&self) -> &'static str {
        match self {
            TerminalKind::ConfigMissing => "CONFIG_MISSING",
            TerminalKind::NotImplemented => "NOT_IMPLEMENTED",
            TerminalKind::Validation => "VALIDATION_ERROR",
        }
    }
}

impl core::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Failure of a single job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient failure; the job is rescheduled with backoff.
    #[error("{0}")]
    Retryable(String),
    /// Permanent failure; the job fails without further attempts.
    #[error("{kind}: {message}")]
    Terminal { kind: TerminalKind, message: String },
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind,
            message: message.into(),
        }
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::terminal(TerminalKind::ConfigMissing, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::terminal(TerminalKind::NotImplemented, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::terminal(TerminalKind::Validation, message)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobError::Terminal { .. })
    }

    /// Classify a free-form message. Anything without a sentinel prefix is
    /// retryable.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        for kind in TerminalKind::ALL {
            if let Some(rest) = message.strip_prefix(kind.prefix()) {
                let rest = rest.trim_start_matches(':').trim_start();
                return Self::terminal(kind, rest);
            }
        }
        Self::Retryable(message)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        Self::from_message(format!("{err:#}"))
    }
}

/// True iff `message` starts with one of the terminal sentinel prefixes
/// (case-sensitive).
pub fn is_terminal_error(message: &str) -> bool {
    TerminalKind::ALL
        .iter()
        .any(|kind| message.starts_with(kind.prefix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_prefixes_are_recognized() {
        assert!(is_terminal_error("CONFIG_MISSING: api key"));
        assert!(is_terminal_error("NOT_IMPLEMENTED: service.teleport"));
        assert!(is_terminal_error("VALIDATION_ERROR: bad input"));
        assert!(is_terminal_error("VALIDATION_ERROR"));
    }

    #[test]
    fn everything_else_is_retryable() {
        assert!(!is_terminal_error(""));
        assert!(!is_terminal_error("temporary glitch"));
        assert!(!is_terminal_error("validation_error: lowercase"));
        assert!(!is_terminal_error(" CONFIG_MISSING leading space"));
        assert!(!is_terminal_error("upstream said NOT_IMPLEMENTED"));
    }

    #[test]
    fn terminal_display_keeps_prefix() {
        let err = JobError::validation("bad input");
        assert_eq!(err.to_string(), "VALIDATION_ERROR: bad input");
        assert!(is_terminal_error(&err.to_string()));

        let err = JobError::retryable("temporary glitch");
        assert_eq!(err.to_string(), "temporary glitch");
        assert!(!err.is_terminal());
    }

    #[test]
    fn from_message_round_trips_prefixed_messages() {
        let err = JobError::from_message("VALIDATION_ERROR: bad input");
        assert_eq!(err, JobError::validation("bad input"));
        assert_eq!(err.to_string(), "VALIDATION_ERROR: bad input");

        let err = JobError::from_message("connection reset");
        assert_eq!(err, JobError::retryable("connection reset"));
    }

    #[test]
    fn anyhow_errors_are_classified_by_message() {
        let err: JobError = anyhow::anyhow!("CONFIG_MISSING: SERVICE_API_KEY").into();
        assert!(err.is_terminal());

        let err: JobError = anyhow::anyhow!("timeout").context("calling service").into();
        assert_eq!(err, JobError::retryable("calling service: timeout"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a message is terminal iff it carries a sentinel prefix.
            #[test]
            fn classification_is_prefix_based(body in ".{0,40}") {
                let expected = TerminalKind::ALL.iter().any(|k| body.starts_with(k.prefix()));
                prop_assert_eq!(is_terminal_error(&body), expected);
                prop_assert_eq!(JobError::from_message(body.clone()).is_terminal(), expected);
            }

            /// Property: prefixing any body with a sentinel makes it terminal.
            #[test]
            fn prefixed_bodies_are_terminal(idx in 0usize..3, body in ".{0,40}") {
                let kind = TerminalKind::ALL[idx];
                let message = format!("{}{}", kind.prefix(), body);
                prop_assert!(is_terminal_error(&message));
            }
        }
    }
}
