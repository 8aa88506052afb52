use oracle_core::ChainCommunicationError;

/// How a failed `send_raw_transaction` is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendErrorClass {
    /// The node already has these bytes or their nonce is used; the attempt
    /// counts as broadcast
    Accepted,
    /// The tx can never be accepted as signed
    Fatal(FatalSendReason),
    /// Retry later with backoff
    Transient,
}

/// Why a send is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSendReason {
    /// The key cannot pay for gas and value
    InsufficientFunds,
    /// The nonce is ahead of the account
    NonceTooHigh,
    /// Gas limit below the intrinsic cost
    IntrinsicGasTooLow,
    /// Bytes do not decode or the signature does not recover
    Malformed,
    /// Execution would revert
    ExecutionReverted,
}

const ACCEPTED: &[&str] = &[
    "already known",
    "known transaction",
    "nonce too low",
    "replacement transaction underpriced",
];

const FATAL: &[(&str, FatalSendReason)] = &[
    ("insufficient funds", FatalSendReason::InsufficientFunds),
    ("nonce too high", FatalSendReason::NonceTooHigh),
    ("intrinsic gas too low", FatalSendReason::IntrinsicGasTooLow),
    ("invalid sender", FatalSendReason::Malformed),
    ("rlp", FatalSendReason::Malformed),
    ("malformed", FatalSendReason::Malformed),
    ("execution reverted", FatalSendReason::ExecutionReverted),
];

/// Classifies a send failure by the node's message. Anything that is not a
/// node answer, or an answer not listed, is transient.
pub fn classify_send_error(err: &ChainCommunicationError) -> SendErrorClass {
    let Some(message) = err.rpc_message() else {
        return SendErrorClass::Transient;
    };
    if ACCEPTED.iter().any(|m| message.contains(m)) {
        return SendErrorClass::Accepted;
    }
    FATAL
        .iter()
        .find(|(m, _)| message.contains(m))
        .map(|(_, reason)| SendErrorClass::Fatal(*reason))
        .unwrap_or(SendErrorClass::Transient)
}
