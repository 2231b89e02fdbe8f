//! In-process channel implementation.
//!
//! [`memory_pair`] yields two connected endpoints of one logical
//! channel. Round trips park the caller on a `oneshot` receiver keyed by
//! correlation id in a pending map, so only the response carrying the
//! matching id can unblock it; everything inbound on the other side
//! surfaces as [`ChannelEvent`]s. Used by the test suite and demos;
//! production transports implement [`Channel`] outside this crate.

use crate::channel::{Channel, ChannelEvent, SessionId};
use crate::error::{Error, ProtocolError, Result};
use crate::message::{Message, MessageKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

struct PendingReply {
    session: SessionId,
    reply_tx: oneshot::Sender<Message>,
}

/// One side of an in-process channel.
pub struct MemoryEndpoint {
    channel_id: String,
    reusable: bool,
    events: broadcast::Sender<ChannelEvent>,
    pending: DashMap<String, PendingReply>,
    sessions: Arc<DashMap<String, bool>>,
    peer: OnceLock<Weak<MemoryEndpoint>>,
}

/// Create a connected pair of endpoints sharing one channel id and one
/// session table. By convention the first endpoint is the client side
/// and the second the server side, but both are fully symmetric.
pub fn memory_pair(
    channel_id: impl Into<String>,
    session_reusable: bool,
) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
    let channel_id = channel_id.into();
    let sessions = Arc::new(DashMap::new());
    let make = || {
        Arc::new(MemoryEndpoint {
            channel_id: channel_id.clone(),
            reusable: session_reusable,
            events: broadcast::channel(EVENT_CAPACITY).0,
            pending: DashMap::new(),
            sessions: Arc::clone(&sessions),
            peer: OnceLock::new(),
        })
    };
    let client = make();
    let server = make();
    let _ = client.peer.set(Arc::downgrade(&server));
    let _ = server.peer.set(Arc::downgrade(&client));
    (client, server)
}

impl MemoryEndpoint {
    fn peer(&self) -> Result<Arc<MemoryEndpoint>> {
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::ChannelClosed)
    }

    fn ensure_connected(&self, session: &SessionId) -> Result<()> {
        if self.sessions.get(&session.0).map(|v| *v).unwrap_or(false) {
            Ok(())
        } else {
            Err(ProtocolError::SessionNotConnected(session.to_string()).into())
        }
    }

    fn emit_both(&self, event: ChannelEvent) {
        // Nobody subscribed yet is fine.
        let _ = self.events.send(event.clone());
        if let Ok(peer) = self.peer() {
            let _ = peer.events.send(event);
        }
    }

    /// Drop the reply senders of every round trip parked on `session`,
    /// failing their waiters with `ChannelClosed`.
    fn fail_waiters(&self, session: &SessionId) {
        self.pending.retain(|_, waiter| waiter.session != *session);
    }
}

#[async_trait]
impl Channel for MemoryEndpoint {
    fn id(&self) -> &str {
        &self.channel_id
    }

    async fn send_message(
        &self,
        session: &SessionId,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.ensure_connected(session)?;
        let correlation_id = message.correlation_id().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingReply {
                session: session.clone(),
                reply_tx,
            },
        );

        let delivered = self.peer()?.events.send(ChannelEvent::MessageReceived {
            session: session.clone(),
            message,
        });
        if delivered.is_err() {
            self.pending.remove(&correlation_id);
            return Err(Error::ChannelClosed);
        }

        let reply = match timeout {
            Some(duration) => match tokio::time::timeout(duration, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&correlation_id);
                    return Err(Error::Timeout(duration));
                }
            },
            None => reply_rx.await,
        };
        reply.map_err(|_| Error::ChannelClosed)
    }

    async fn send_one_way(&self, session: &SessionId, message: Message) -> Result<()> {
        self.ensure_connected(session)?;
        match message.kind() {
            MessageKind::Response | MessageKind::Acknowledge => {
                // Complete the peer's waiter, if one matches. A foreign
                // correlation id never unblocks anybody.
                let peer = self.peer()?;
                match peer.pending.remove(message.correlation_id()) {
                    Some((correlation_id, waiter)) => {
                        if waiter.reply_tx.send(message).is_err() {
                            debug!(%correlation_id, "waiter gone before reply arrived");
                        }
                    }
                    None => {
                        warn!(correlation_id = message.correlation_id(),
                            "dropping reply with no matching request");
                    }
                }
                Ok(())
            }
            _ => {
                let delivered = self.peer()?.events.send(ChannelEvent::MessageReceived {
                    session: session.clone(),
                    message,
                });
                if delivered.is_err() {
                    return Err(Error::ChannelClosed);
                }
                Ok(())
            }
        }
    }

    async fn connect(&self, _endpoint: &str) -> Result<SessionId> {
        let session = SessionId::new(Uuid::new_v4().to_string());
        self.sessions.insert(session.0.clone(), true);
        self.emit_both(ChannelEvent::SessionStateChanged {
            session: session.clone(),
            connected: true,
        });
        debug!(session = %session, "session connected");
        Ok(session)
    }

    async fn disconnect(&self, session: &SessionId) -> Result<()> {
        self.sessions.remove(&session.0);
        self.fail_waiters(session);
        if let Ok(peer) = self.peer() {
            peer.fail_waiters(session);
        }
        self.emit_both(ChannelEvent::SessionStateChanged {
            session: session.clone(),
            connected: false,
        });
        debug!(session = %session, "session disconnected");
        Ok(())
    }

    fn is_session_reusable(&self) -> bool {
        self.reusable
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InvokeMode, Message, MessageKind};
    use bytes::Bytes;

    fn request(correlation_id: &str) -> Message {
        Message::request(
            MessageKind::Request,
            correlation_id,
            "Echo",
            "Say",
            vec![],
            InvokeMode::RequestService,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn round_trip_completes_with_matching_correlation() {
        let (client, server) = memory_pair("mem", true);
        let mut inbound = server.subscribe();
        let session = client.connect("local").await.unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            let session = session.clone();
            tokio::spawn(async move {
                loop {
                    if let ChannelEvent::MessageReceived { message, .. } =
                        inbound.recv().await.unwrap()
                    {
                        let reply = Message::response(
                            message.correlation_id().to_string(),
                            "String",
                            Bytes::from_static(b"ok"),
                            None,
                        )
                        .unwrap();
                        server.send_one_way(&session, reply).await.unwrap();
                        break;
                    }
                }
            })
        };

        let reply = client
            .send_message(&session, request("c-1"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.correlation_id(), "c-1");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_correlation_does_not_unblock_waiter() {
        let (client, server) = memory_pair("mem", true);
        let mut inbound = server.subscribe();
        let session = client.connect("local").await.unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            let session = session.clone();
            tokio::spawn(async move {
                loop {
                    if let ChannelEvent::MessageReceived { .. } = inbound.recv().await.unwrap() {
                        // Reply with the wrong id first, then the right one.
                        let stray =
                            Message::response("someone-else", "String", Bytes::new(), None)
                                .unwrap();
                        server.send_one_way(&session, stray).await.unwrap();
                        let reply =
                            Message::response("c-2", "String", Bytes::new(), None).unwrap();
                        server.send_one_way(&session, reply).await.unwrap();
                        break;
                    }
                }
            })
        };

        let reply = client
            .send_message(&session, request("c-2"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.correlation_id(), "c-2");
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, server) = memory_pair("mem", true);
        let _inbound = server.subscribe();
        let session = client.connect("local").await.unwrap();

        let err = client
            .send_message(&session, request("c-3"), Some(Duration::from_millis(250)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_round_trips() {
        let (client, server) = memory_pair("mem", true);
        let _inbound = server.subscribe();
        let session = client.connect("local").await.unwrap();

        let waiter = {
            let client = Arc::clone(&client);
            let session = session.clone();
            tokio::spawn(async move {
                // Infinite timeout: only the disconnect can unpark this.
                client.send_message(&session, request("c-5"), None).await
            })
        };
        // Let the round trip park on its reply first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.disconnect(&session).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[tokio::test]
    async fn send_on_disconnected_session_fails() {
        let (client, server) = memory_pair("mem", true);
        let _inbound = server.subscribe();
        let session = client.connect("local").await.unwrap();
        client.disconnect(&session).await.unwrap();

        let err = client
            .send_message(&session, request("c-4"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
