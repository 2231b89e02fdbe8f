//! The typed message envelope exchanged over a channel.
//!
//! A [`Message`] pairs a [`MessageHeader`] (correlation id, call context,
//! timestamp) with a [`MessageBody`]. Request-shaped bodies carry the
//! contract name, method name and ordered parameters; a response body
//! carries the return value or an [`InvocationFault`].

use crate::error::{InvocationFault, ProtocolError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved context key under which a proxy stores its identifier.
pub const PROXY_ID_KEY: &str = "remoting.proxy-id";

/// Kind of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Fire-and-acknowledge request; no response body is produced.
    Datagram,
    /// Fire-and-forget request; no acknowledge either.
    DatagramOneway,
    /// Request expecting exactly one correlated response.
    Request,
    /// Response to a request, correlated by id.
    Response,
    /// Acknowledge for a datagram.
    Acknowledge,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Datagram => "Datagram",
            Self::DatagramOneway => "DatagramOneway",
            Self::Request => "Request",
            Self::Response => "Response",
            Self::Acknowledge => "Acknowledge",
        };
        f.write_str(name)
    }
}

/// Direction of a request relative to the channel's two dispatchers.
///
/// A service dispatcher only processes `RequestService`; a client-side
/// callback dispatcher only processes `RequestCallback`. The two can share
/// one channel without stealing each other's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeMode {
    /// Client-to-server invocation.
    RequestService,
    /// Server-to-client callback invocation.
    RequestCallback,
}

/// One positional method parameter.
///
/// The value is already serialized by the payload formatter; this core
/// treats it as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodParameter {
    /// Zero-based position in the parameter list.
    pub index: usize,
    /// Textual name of the parameter's type.
    pub type_name: String,
    /// Serialized parameter value.
    pub value: Bytes,
}

impl MethodParameter {
    /// Create a parameter at the given position.
    pub fn new(index: usize, type_name: impl Into<String>, value: Bytes) -> Self {
        Self {
            index,
            type_name: type_name.into(),
            value,
        }
    }
}

/// Envelope header shared by all message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Opaque token linking a request to its response. Stable across one
    /// logical exchange.
    pub correlation_id: String,
    /// Call context carried alongside the body. The proxy identifier
    /// travels under [`PROXY_ID_KEY`].
    pub context: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch at construction time.
    pub sent_at_ms: u64,
}

impl MessageHeader {
    fn new(correlation_id: String) -> Result<Self> {
        if correlation_id.is_empty() {
            return Err(
                ProtocolError::InvalidMessage("correlation id must not be empty".into()).into(),
            );
        }
        let sent_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            correlation_id,
            context: BTreeMap::new(),
            sent_at_ms,
        })
    }

    /// Proxy id carried in the context, if any.
    pub fn proxy_id(&self) -> Option<u64> {
        self.context.get(PROXY_ID_KEY).and_then(|v| v.parse().ok())
    }
}

/// Request payload shared by `Request`, `Datagram` and `DatagramOneway`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Name of the service contract type.
    pub contract_name: String,
    /// Name of the method to invoke.
    pub method_name: String,
    /// Ordered parameters; `parameters[i].index == i` is enforced at
    /// construction.
    pub parameters: Vec<MethodParameter>,
    /// Which dispatcher this request is addressed to.
    pub invoke_mode: InvokeMode,
}

/// Response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Return value as a typed parameter at index 0.
    pub return_value: MethodParameter,
    /// Fault raised by the invocation, if any.
    pub fault: Option<InvocationFault>,
}

/// Body of a message, discriminating its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Request expecting an acknowledge only.
    Datagram(RequestBody),
    /// Request expecting nothing back.
    DatagramOneway(RequestBody),
    /// Request expecting a correlated response.
    Request(RequestBody),
    /// Correlated response.
    Response(ResponseBody),
    /// Acknowledge for a datagram.
    Acknowledge,
}

/// A complete message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Envelope header.
    pub header: MessageHeader,
    /// Envelope body.
    pub body: MessageBody,
}

impl Message {
    /// Build a request-kind message.
    ///
    /// # Errors
    ///
    /// Rejects an empty correlation id, empty contract or method name, and
    /// parameters whose index does not match their position.
    pub fn request(
        kind: MessageKind,
        correlation_id: impl Into<String>,
        contract_name: impl Into<String>,
        method_name: impl Into<String>,
        parameters: Vec<MethodParameter>,
        invoke_mode: InvokeMode,
    ) -> Result<Self> {
        let contract_name = contract_name.into();
        let method_name = method_name.into();
        if contract_name.is_empty() {
            return Err(
                ProtocolError::InvalidMessage("contract name must not be empty".into()).into(),
            );
        }
        if method_name.is_empty() {
            return Err(
                ProtocolError::InvalidMessage("method name must not be empty".into()).into(),
            );
        }
        for (position, parameter) in parameters.iter().enumerate() {
            if parameter.index != position {
                return Err(ProtocolError::InvalidMessage(format!(
                    "parameter at position {position} carries index {}",
                    parameter.index
                ))
                .into());
            }
        }
        let body = RequestBody {
            contract_name,
            method_name,
            parameters,
            invoke_mode,
        };
        let body = match kind {
            MessageKind::Request => MessageBody::Request(body),
            MessageKind::Datagram => MessageBody::Datagram(body),
            MessageKind::DatagramOneway => MessageBody::DatagramOneway(body),
            other => {
                return Err(ProtocolError::UnexpectedMessageKind {
                    expected: "Request, Datagram or DatagramOneway".into(),
                    actual: other.to_string(),
                }
                .into());
            }
        };
        Ok(Self {
            header: MessageHeader::new(correlation_id.into())?,
            body,
        })
    }

    /// Build a response correlated to `correlation_id`.
    pub fn response(
        correlation_id: impl Into<String>,
        return_type: impl Into<String>,
        return_value: Bytes,
        fault: Option<InvocationFault>,
    ) -> Result<Self> {
        Ok(Self {
            header: MessageHeader::new(correlation_id.into())?,
            body: MessageBody::Response(ResponseBody {
                return_value: MethodParameter::new(0, return_type, return_value),
                fault,
            }),
        })
    }

    /// Build an acknowledge correlated to `correlation_id`.
    pub fn acknowledge(correlation_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            header: MessageHeader::new(correlation_id.into())?,
            body: MessageBody::Acknowledge,
        })
    }

    /// Kind of this message, derived from the body.
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Datagram(_) => MessageKind::Datagram,
            MessageBody::DatagramOneway(_) => MessageKind::DatagramOneway,
            MessageBody::Request(_) => MessageKind::Request,
            MessageBody::Response(_) => MessageKind::Response,
            MessageBody::Acknowledge => MessageKind::Acknowledge,
        }
    }

    /// Correlation id of this message.
    pub fn correlation_id(&self) -> &str {
        &self.header.correlation_id
    }

    /// Request body, for the three request-shaped kinds.
    pub fn request_body(&self) -> Option<&RequestBody> {
        match &self.body {
            MessageBody::Datagram(body)
            | MessageBody::DatagramOneway(body)
            | MessageBody::Request(body) => Some(body),
            _ => None,
        }
    }

    /// Response body, when this is a response.
    pub fn response_body(&self) -> Option<&ResponseBody> {
        match &self.body {
            MessageBody::Response(body) => Some(body),
            _ => None,
        }
    }

    /// Attach the sending proxy's id to the call context.
    pub fn with_proxy_id(mut self, proxy_id: u64) -> Self {
        self.header
            .context
            .insert(PROXY_ID_KEY.to_string(), proxy_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(type_names: &[&str]) -> Vec<MethodParameter> {
        type_names
            .iter()
            .enumerate()
            .map(|(i, t)| MethodParameter::new(i, *t, Bytes::new()))
            .collect()
    }

    #[test]
    fn request_construction_validates_names() {
        let err = Message::request(
            MessageKind::Request,
            "c1",
            "",
            "Say",
            vec![],
            InvokeMode::RequestService,
        );
        assert!(err.is_err());

        let err = Message::request(
            MessageKind::Request,
            "c1",
            "Echo",
            "",
            vec![],
            InvokeMode::RequestService,
        );
        assert!(err.is_err());
    }

    #[test]
    fn request_rejects_empty_correlation_id() {
        let err = Message::request(
            MessageKind::Request,
            "",
            "Echo",
            "Say",
            vec![],
            InvokeMode::RequestService,
        );
        assert!(err.is_err());
    }

    #[test]
    fn request_rejects_misindexed_parameters() {
        let mut parameters = params(&["String", "Int"]);
        parameters[1].index = 5;
        let err = Message::request(
            MessageKind::Request,
            "c1",
            "Echo",
            "Say",
            parameters,
            InvokeMode::RequestService,
        );
        assert!(err.is_err());
    }

    #[test]
    fn request_rejects_response_kind() {
        let err = Message::request(
            MessageKind::Response,
            "c1",
            "Echo",
            "Say",
            vec![],
            InvokeMode::RequestService,
        );
        assert!(err.is_err());
    }

    #[test]
    fn kind_is_derived_from_body() {
        let message = Message::request(
            MessageKind::DatagramOneway,
            "c1",
            "Echo",
            "Say",
            params(&["String"]),
            InvokeMode::RequestService,
        )
        .unwrap();
        assert_eq!(message.kind(), MessageKind::DatagramOneway);

        let response = Message::response("c1", "String", Bytes::new(), None).unwrap();
        assert_eq!(response.kind(), MessageKind::Response);
    }

    #[test]
    fn proxy_id_round_trips_through_context() {
        let message = Message::request(
            MessageKind::Request,
            "c1",
            "Echo",
            "Say",
            vec![],
            InvokeMode::RequestService,
        )
        .unwrap()
        .with_proxy_id(42);
        assert_eq!(message.header.proxy_id(), Some(42));
    }

    #[test]
    fn envelope_round_trips_through_bincode() {
        let message = Message::request(
            MessageKind::Request,
            "c1",
            "Echo",
            "Say",
            params(&["String"]),
            InvokeMode::RequestService,
        )
        .unwrap();
        let bytes = bincode::serialize(&message).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, message);
    }
}
