use std::fmt;

/// Crate-wide error taxonomy. Every public function in `frakti-core` returns
/// `Result<T>` built on this enum; backend/network/storage failures are wrapped
/// here rather than surfacing their native error types to callers.
#[derive(Debug)]
pub enum FraktiError {
    /// Sandbox/container/image unknown to the backend or registry.
    NotFound {
        resource: String,
        context: Option<String>,
    },
    /// Caller supplied a bad argument (negative timeout, empty id, malformed name field).
    InvalidArgument {
        message: String,
        context: Option<String>,
    },
    /// Fatal startup mismatch (cgroup-driver disagreement with a backend).
    Conflict {
        message: String,
        context: Option<String>,
    },
    /// Backend RPC transport failure.
    BackendUnavailable {
        backend: String,
        message: String,
        context: Option<String>,
    },
    /// Image pull made no progress within the stall timeout.
    PullStalled {
        image_ref: String,
        elapsed_secs: u64,
    },
    /// Stream extractor observed an invalid frame header byte.
    ProtocolError { message: String },
    /// Caller-supplied exec/attach timeout elapsed before the backend returned.
    DeadlineExceeded { message: String },
    /// RPC deliberately left unimplemented (spec §9); maps to CRI's `UNIMPLEMENTED` status.
    Unimplemented { rpc: String },
    /// Name codec could not parse a canonical name.
    MalformedName { name: String, reason: String },
    /// Checkpoint store I/O failure not reducible to `NotFound`.
    Storage {
        message: String,
        context: Option<String>,
    },
    Io {
        error: std::io::Error,
        context: Option<String>,
    },
    Serialization {
        message: String,
        context: Option<String>,
    },
}

impl FraktiError {
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        FraktiError::NotFound {
            resource: resource.into(),
            context: None,
        }
    }

    pub fn not_found_with_context<S1: Into<String>, S2: Into<String>>(
        resource: S1,
        ctx: S2,
    ) -> Self {
        FraktiError::NotFound {
            resource: resource.into(),
            context: Some(ctx.into()),
        }
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        FraktiError::InvalidArgument {
            message: msg.into(),
            context: None,
        }
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        FraktiError::Conflict {
            message: msg.into(),
            context: None,
        }
    }

    pub fn backend_unavailable<S1: Into<String>, S2: Into<String>>(
        backend: S1,
        message: S2,
    ) -> Self {
        FraktiError::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn pull_stalled<S: Into<String>>(image_ref: S, elapsed_secs: u64) -> Self {
        FraktiError::PullStalled {
            image_ref: image_ref.into(),
            elapsed_secs,
        }
    }

    pub fn protocol_error<S: Into<String>>(msg: S) -> Self {
        FraktiError::ProtocolError {
            message: msg.into(),
        }
    }

    pub fn deadline_exceeded<S: Into<String>>(msg: S) -> Self {
        FraktiError::DeadlineExceeded { message: msg.into() }
    }

    pub fn unimplemented<S: Into<String>>(rpc: S) -> Self {
        FraktiError::Unimplemented { rpc: rpc.into() }
    }

    pub fn malformed_name<S1: Into<String>, S2: Into<String>>(name: S1, reason: S2) -> Self {
        FraktiError::MalformedName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        FraktiError::Storage {
            message: msg.into(),
            context: None,
        }
    }

    /// Idempotency boundary: NOT_FOUND on a remove is treated as success by callers
    /// that check this, per the shim's propagation policy (never retry, only
    /// collapse well-known not-found-on-remove cases).
    pub fn is_not_found(&self) -> bool {
        matches!(self, FraktiError::NotFound { .. })
    }
}

impl fmt::Display for FraktiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FraktiError::NotFound { resource, context } => {
                write!(f, "not found: {}", resource)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::InvalidArgument { message, context } => {
                write!(f, "invalid argument: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::Conflict { message, context } => {
                write!(f, "conflict: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::BackendUnavailable {
                backend,
                message,
                context,
            } => {
                write!(f, "backend '{}' unavailable: {}", backend, message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::PullStalled {
                image_ref,
                elapsed_secs,
            } => write!(
                f,
                "pull stalled for '{}': no progress in {}s",
                image_ref, elapsed_secs
            ),
            FraktiError::ProtocolError { message } => write!(f, "protocol error: {}", message),
            FraktiError::DeadlineExceeded { message } => write!(f, "deadline exceeded: {}", message),
            FraktiError::Unimplemented { rpc } => write!(f, "unimplemented: {}", rpc),
            FraktiError::MalformedName { name, reason } => {
                write!(f, "malformed name '{}': {}", name, reason)
            }
            FraktiError::Storage { message, context } => {
                write!(f, "storage error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::Io { error, context } => {
                write!(f, "io error: {}", error)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
            FraktiError::Serialization { message, context } => {
                write!(f, "serialization error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " (context: {})", ctx)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for FraktiError {}

impl From<std::io::Error> for FraktiError {
    fn from(e: std::io::Error) -> Self {
        FraktiError::Io {
            error: e,
            context: None,
        }
    }
}

impl From<serde_json::Error> for FraktiError {
    fn from(e: serde_json::Error) -> Self {
        FraktiError::Serialization {
            message: e.to_string(),
            context: Some("JSON parsing error".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FraktiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_includes_resource() {
        let e = FraktiError::not_found("sandbox-123");
        assert!(e.to_string().contains("sandbox-123"));
        assert!(e.is_not_found());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let e: FraktiError = io_err.into();
        assert!(matches!(e, FraktiError::Io { .. }));
    }
}
