//! Error types for the remoting core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for remoting operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for remoting operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Registration-time configuration errors.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during payload serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A remote method invocation failed; the fault was carried back
    /// inside the response.
    #[error("Remote method invocation failed: {0}")]
    RemoteInvocation(InvocationFault),

    /// The round trip did not complete within the operation's call timeout.
    ///
    /// Distinguished from transport errors so callers can apply retry
    /// policy specifically to expiry.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The proxy (or service object) was already disposed.
    #[error("Object disposed: {0}")]
    ObjectDisposed(String),

    /// No matching proxy registration was found.
    #[error("Proxy not registered: {0}")]
    ProxyNotRegistered(String),

    /// An operation was used outside its valid state, e.g. a manual reply
    /// with no request in flight, or `end_create` with a foreign handle.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Transport failure reported by the channel.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Channel closed while a reply was outstanding.
    #[error("Channel closed")]
    ChannelClosed,
}

/// Registration-time configuration errors.
///
/// These are raised synchronously from registry mutation calls and never
/// corrupt already-committed state: a failed registration leaves the
/// registry exactly as it was.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The contract already has a descriptor in this registry.
    #[error("Contract '{0}' is already registered")]
    DuplicateRegistration(String),

    /// The contract has no descriptor in this registry.
    #[error("Contract '{0}' is not registered")]
    ContractNotRegistered(String),

    /// The referenced channel is not known to the registry.
    #[error("Channel '{0}' is not registered")]
    ChannelNotFound(String),

    /// The implementation does not line up with the contract's operations.
    #[error("Implementation '{type_name}' does not satisfy contract '{contract}': {reason}")]
    InvalidImplementation {
        /// Contract the implementation was registered against.
        contract: String,
        /// Implementation type name.
        type_name: String,
        /// What is missing or extraneous.
        reason: String,
    },

    /// An operation descriptor is malformed.
    #[error("Invalid operation '{operation}' on contract '{contract}': {reason}")]
    InvalidOperation {
        /// Contract declaring the operation.
        contract: String,
        /// Operation name.
        operation: String,
        /// Why the descriptor was rejected.
        reason: String,
    },
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message failed construction-time validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A message of an unexpected kind arrived.
    #[error("Unexpected message kind: expected {expected}, got {actual}")]
    UnexpectedMessageKind {
        /// Expected message kind.
        expected: String,
        /// Actual message kind received.
        actual: String,
    },

    /// A response arrived whose correlation id matches no outstanding request.
    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(String),

    /// The peer session is not connected.
    #[error("Session '{0}' is not connected")]
    SessionNotConnected(String),
}

/// Codec-related errors for the opaque payload formatter.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Category of a fault raised while handling an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The contract name matched no service-side registration.
    ContractNotRegistered,
    /// Neither a per-channel nor a default implementation exists.
    ImplementationMissing,
    /// Constructing the service instance failed.
    ConstructionFailed,
    /// A parameter's type name could not be resolved.
    ParameterUnresolved,
    /// No method matched the name and parameter-type signature.
    MethodNotFound,
    /// The method body raised an error.
    MethodFailed,
    /// The payload could not be serialized or deserialized.
    CodecFailed,
    /// The transport failed while carrying the exchange.
    TransportFailed,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContractNotRegistered => "contract-not-registered",
            Self::ImplementationMissing => "implementation-missing",
            Self::ConstructionFailed => "construction-failed",
            Self::ParameterUnresolved => "parameter-unresolved",
            Self::MethodNotFound => "method-not-found",
            Self::MethodFailed => "method-failed",
            Self::CodecFailed => "codec-failed",
            Self::TransportFailed => "transport-failed",
        };
        f.write_str(name)
    }
}

/// A fault carried *inside* a response message.
///
/// Invocation failures are delivered as data, never thrown across the
/// wire; the proxy surfaces them as [`Error::RemoteInvocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct InvocationFault {
    /// Fault category.
    pub kind: FaultKind,
    /// Human-readable description, carries the original failure message.
    pub message: String,
    /// Offending parameter, when the fault concerns one.
    pub parameter: Option<String>,
}

impl InvocationFault {
    /// Create a fault with the given category and message.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            parameter: None,
        }
    }

    /// Create a fault naming the offending parameter.
    pub fn for_parameter(
        kind: FaultKind,
        parameter: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            parameter: Some(parameter.into()),
        }
    }

    /// Fault describing a failed method body.
    pub fn method_failed(message: impl fmt::Display) -> Self {
        Self::new(FaultKind::MethodFailed, message.to_string())
    }
}

impl From<InvocationFault> for Error {
    fn from(fault: InvocationFault) -> Self {
        Self::RemoteInvocation(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display_includes_kind_and_message() {
        let fault = InvocationFault::new(FaultKind::MethodNotFound, "no Say(String)");
        assert_eq!(fault.to_string(), "method-not-found: no Say(String)");
    }

    #[test]
    fn fault_round_trips_through_bincode() {
        let fault =
            InvocationFault::for_parameter(FaultKind::ParameterUnresolved, "arg1", "unknown type");
        let bytes = bincode::serialize(&fault).unwrap();
        let back: InvocationFault = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, fault);
    }
}
