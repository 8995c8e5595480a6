use thiserror::Error;

/// The error taxonomy for the whole of localflare.
///
/// Covers sandbox-level errors, binding/storage-contract errors,
/// cancellation, relational errors, and a catch-all `internal` kind. Tests
/// assert on [`LocalflareError::code`], never on the `Display` message, so
/// that message wording can change freely.
#[derive(Debug, Error)]
pub enum LocalflareError {
    #[error("script failed to compile: {0}")]
    ScriptCompile(String),

    #[error("no fetch handler was registered")]
    NoHandler,

    #[error("handler threw: {0}")]
    HandlerException(String),

    #[error("binding not found: {0}")]
    BindingNotFound(String),

    #[error("invalid binding value for {0}")]
    InvalidBindingValue(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entity too large: {0}")]
    EntityTooLarge(String),

    #[error("aborted")]
    Aborted,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("sql syntax error: {0}")]
    SqlSyntax(String),

    #[error("sql runtime error: {0}")]
    SqlRuntime(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LocalflareError>;

impl LocalflareError {
    /// A stable code string for this error kind, independent of the message.
    ///
    /// This is what crosses the sandbox boundary as `Error.code` on the
    /// rejected JS promise (see `localflare-bindings`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScriptCompile(_) => "script-compile",
            Self::NoHandler => "no-handler",
            Self::HandlerException(_) => "handler-exception",
            Self::BindingNotFound(_) => "binding-not-found",
            Self::InvalidBindingValue(_) => "invalid-binding-value",
            Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "already-exists",
            Self::PermissionDenied(_) => "permission-denied",
            Self::Unsupported(_) => "unsupported",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::EntityTooLarge(_) => "entity-too-large",
            Self::Aborted => "aborted",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::ConstraintViolation(_) => "constraint-violation",
            Self::SqlSyntax(_) => "sql-syntax",
            Self::SqlRuntime(_) => "sql-runtime",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for LocalflareError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match &e {
            E::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(e.to_string())
            }
            E::SqlInputError { .. } => Self::SqlSyntax(e.to_string()),
            _ => Self::SqlRuntime(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_and_kebab_case() {
        assert_eq!(LocalflareError::NotFound("x".into()).code(), "not-found");
        assert_eq!(LocalflareError::Aborted.code(), "aborted");
        assert_eq!(
            LocalflareError::ConstraintViolation("x".into()).code(),
            "constraint-violation"
        );
    }
}
