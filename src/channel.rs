//! The abstract bidirectional channel boundary.
//!
//! The remoting core does not implement a wire transport. It consumes a
//! [`Channel`]: something that can round-trip a message within a session,
//! push one-way messages, manage session connect/disconnect, and surface
//! inbound traffic as [`ChannelEvent`]s. The in-process implementation in
//! [`crate::memory`] exists for tests and demos; production transports
//! live outside this crate.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Identifier of one logical session on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event pushed by a channel to its subscribers.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An inbound message was delivered for a session.
    MessageReceived {
        /// Session the message belongs to.
        session: SessionId,
        /// The delivered message.
        message: Message,
    },
    /// A session's connection state changed.
    SessionStateChanged {
        /// Session whose state changed.
        session: SessionId,
        /// Whether the session is now connected.
        connected: bool,
    },
}

/// Abstract bidirectional message transport keyed by session id.
///
/// `send_message` is the blocking round trip the proxy layer builds on:
/// it returns the correlated reply or fails with
/// [`crate::Error::Timeout`] when `timeout` elapses first (`None` means
/// wait forever). `send_one_way` pushes a message without waiting; it is
/// used for responses, acknowledges and one-way datagrams.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Stable identifier of this channel, used as a registry key.
    fn id(&self) -> &str;

    /// Round-trip `message` on `session`, returning the correlated reply.
    async fn send_message(
        &self,
        session: &SessionId,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message>;

    /// Push `message` on `session` without waiting for anything back.
    async fn send_one_way(&self, session: &SessionId, message: Message) -> Result<()>;

    /// Establish a session to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<SessionId>;

    /// Tear down `session`.
    async fn disconnect(&self, session: &SessionId) -> Result<()>;

    /// Whether one session may be shared by many proxies. When `false`,
    /// each proxy owns its session and disconnects it on dispose.
    fn is_session_reusable(&self) -> bool;

    /// Subscribe to inbound messages and session-state changes.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}
