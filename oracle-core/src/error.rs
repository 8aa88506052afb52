use std::fmt::Debug;

use thiserror::Error;

use crate::Address;

/// Result type for anything that talks to the chain
pub type ChainResult<T> = Result<T, ChainCommunicationError>;

/// Errors returned by a chain client or a key store.
#[derive(Error, Debug)]
pub enum ChainCommunicationError {
    /// The node answered with a JSON-RPC error
    #[error("rpc error (code {code:?}): {message}")]
    Rpc {
        /// JSON-RPC error code, if one was returned
        code: Option<i64>,
        /// The message as reported by the node
        message: String,
    },
    /// The request never reached the node or the response was lost
    #[error("transport error: {0}")]
    Transport(String),
    /// The request did not complete in time
    #[error("request timed out")]
    Timeout,
    /// A subscription stream ended
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
    /// The key store has no key for the requested address
    #[error("no signing key for address {0:?}")]
    KeyNotFound(Address),
    /// Signing failed
    #[error("signing error: {0}")]
    Signing(String),
    /// A response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// Anything else
    #[error("{0}")]
    CustomError(String),
}

impl ChainCommunicationError {
    /// Creates a chain communication error from any other existing error
    pub fn from_other<E: std::error::Error>(err: E) -> Self {
        Self::CustomError(err.to_string())
    }

    /// Creates a chain communication error from a string
    pub fn from_other_str(err: &str) -> Self {
        Self::CustomError(err.to_owned())
    }

    /// Creates a JSON-RPC error
    pub fn rpc(code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// The message the node returned, lowercased, if this is an rpc error.
    pub fn rpc_message(&self) -> Option<String> {
        match self {
            Self::Rpc { message, .. } => Some(message.to_lowercase()),
            _ => None,
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::SubscriptionClosed(_) => true,
            Self::Rpc { code, message } => {
                let msg = message.to_lowercase();
                // -32005 is the conventional rate limit code
                *code == Some(-32005)
                    || msg.contains("rate limit")
                    || msg.contains("too many requests")
                    || msg.contains("header not found")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            Self::KeyNotFound(_) | Self::Signing(_) | Self::Decode(_) | Self::CustomError(_) => {
                false
            }
        }
    }
}
