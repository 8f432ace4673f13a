//! Error kinds for tunneled calls.
//!
//! A small closed set of kinds with an explicit cause relation: callers walk
//! [`TunnelError::cause`] instead of downcasting.

use thiserror::Error;

/// Errors produced while encoding, forwarding or replaying a tunneled request.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The caller went away before the call completed.
    #[error("context canceled")]
    Canceled,

    /// The remote side answered with a gRPC status.
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    /// The channel could not be created or used.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The request could not be encoded or replayed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The target address used a scheme we cannot resolve.
    #[error("unrecognised scheme: {0}")]
    UnsupportedScheme(String),

    /// The target address could not be parsed.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Another error with extra context prepended.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TunnelError>,
    },
}

impl TunnelError {
    /// Wrap this error with a context message.
    pub fn context(self, context: impl Into<String>) -> Self {
        TunnelError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The directly wrapped error, if any.
    pub fn cause(&self) -> Option<&TunnelError> {
        match self {
            TunnelError::Context { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The innermost error of the cause chain.
    pub fn root(&self) -> &TunnelError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// True if the chain contains a cancellation, either local or reported by
    /// the remote side as `Cancelled`.
    pub fn is_canceled(&self) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            match err {
                TunnelError::Canceled => return true,
                TunnelError::Status(status) if status.code() == tonic::Code::Cancelled => {
                    return true
                }
                _ => current = err.cause(),
            }
        }
        false
    }
}

/// True if a gRPC status reports a canceled call.
pub fn is_canceled(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_is_walkable() {
        let err = TunnelError::Canceled.context("reading body").context("handle");
        assert_eq!(err.to_string(), "handle: reading body: context canceled");
        assert!(matches!(err.root(), TunnelError::Canceled));
        assert!(err.is_canceled());
    }

    #[test]
    fn cancelled_status_counts_as_canceled() {
        let err = TunnelError::from(tonic::Status::cancelled("gone"));
        assert!(err.is_canceled());
        assert!(!TunnelError::from(tonic::Status::internal("boom")).is_canceled());
    }
}
