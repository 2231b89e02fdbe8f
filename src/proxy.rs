//! Client-side proxies.
//!
//! A [`RemoteProxy`] turns a local method call into a request message,
//! round-trips it over the channel and unblocks the caller with the
//! return value or the remote fault. A [`ProxyFactory`] creates proxies
//! for one contract, either synchronously or through the
//! `begin_create`/`end_create` pair gated by a counted semaphore.

use crate::channel::{Channel, SessionId};
use crate::contract::{LifetimeMode, MethodKey, OperationDescriptor};
use crate::error::{Error, FaultKind, InvocationFault, ProtocolError, RegistrationError, Result};
use crate::lifetime::LifetimeManager;
use crate::message::{InvokeMode, Message, MessageKind, MethodParameter};
use crate::registry::ContractRegistry;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Client-side stand-in for a remote contract.
pub struct RemoteProxy {
    proxy_id: u64,
    contract: String,
    channel: Arc<dyn Channel>,
    session: SessionId,
    registry: Arc<ContractRegistry>,
    lifetimes: Arc<LifetimeManager>,
    invoke_mode: InvokeMode,
    registered: bool,
    disposed: AtomicBool,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("proxy_id", &self.proxy_id)
            .field("contract", &self.contract)
            .field("session", &self.session)
            .field("invoke_mode", &self.invoke_mode)
            .field("registered", &self.registered)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl RemoteProxy {
    /// Process-wide identifier of this proxy.
    pub fn proxy_id(&self) -> u64 {
        self.proxy_id
    }

    /// Session the proxy talks over.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Contract the proxy stands in for.
    pub fn contract(&self) -> &str {
        &self.contract
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::ObjectDisposed(format!(
                "proxy {} for contract '{}'",
                self.proxy_id, self.contract
            )))
        } else {
            Ok(())
        }
    }

    fn descriptor_for(&self, method: &str, parameters: &[MethodParameter]) -> OperationDescriptor {
        let key = MethodKey::for_parameters(method, parameters);
        match self.registry.client_operation(&self.contract, &key) {
            Some(descriptor) => descriptor,
            None => {
                debug!(contract = %self.contract, method = %key,
                    "operation not declared client-side, using default metadata");
                OperationDescriptor::default()
            }
        }
    }

    /// Invoke a remote method and block (asynchronously) until the
    /// correlated response arrives or the call timeout elapses.
    ///
    /// Returns the serialized return value. A fault carried in the
    /// response surfaces as [`Error::RemoteInvocation`]; transport
    /// failures are wrapped the same way; timeout stays distinguished as
    /// [`Error::Timeout`].
    #[instrument(skip(self, parameters), fields(contract = %self.contract, proxy_id = self.proxy_id))]
    pub async fn invoke(&self, method: &str, parameters: Vec<MethodParameter>) -> Result<Bytes> {
        self.ensure_live()?;
        let descriptor = self.descriptor_for(method, &parameters);
        let kind = if descriptor.one_way {
            MessageKind::DatagramOneway
        } else if !descriptor.reliable {
            MessageKind::Datagram
        } else {
            MessageKind::Request
        };
        let message = Message::request(
            kind,
            Uuid::new_v4().to_string(),
            self.contract.clone(),
            method,
            parameters,
            self.invoke_mode,
        )?
        .with_proxy_id(self.proxy_id);
        let correlation_id = message.correlation_id().to_string();

        match kind {
            MessageKind::DatagramOneway => {
                self.channel
                    .send_one_way(&self.session, message)
                    .await
                    .map_err(wrap_transport)?;
                Ok(Bytes::new())
            }
            MessageKind::Datagram => {
                let reply = self
                    .channel
                    .send_message(&self.session, message, descriptor.call_timeout)
                    .await
                    .map_err(wrap_transport)?;
                // Acknowledge only; nothing surfaces to the caller.
                if reply.kind() != MessageKind::Acknowledge {
                    return Err(ProtocolError::UnexpectedMessageKind {
                        expected: MessageKind::Acknowledge.to_string(),
                        actual: reply.kind().to_string(),
                    }
                    .into());
                }
                Ok(Bytes::new())
            }
            _ => {
                let reply = self
                    .channel
                    .send_message(&self.session, message, descriptor.call_timeout)
                    .await
                    .map_err(wrap_transport)?;
                if reply.correlation_id() != correlation_id {
                    return Err(
                        ProtocolError::UnknownCorrelation(reply.correlation_id().into()).into(),
                    );
                }
                let body = reply.response_body().ok_or_else(|| {
                    Error::from(ProtocolError::UnexpectedMessageKind {
                        expected: MessageKind::Response.to_string(),
                        actual: reply.kind().to_string(),
                    })
                })?;
                match &body.fault {
                    Some(fault) => Err(Error::RemoteInvocation(fault.clone())),
                    None => Ok(body.return_value.value.clone()),
                }
            }
        }
    }

    /// Dispose the proxy: unregister it and, when the channel does not
    /// reuse sessions, disconnect its session. Idempotent; any call to
    /// [`RemoteProxy::invoke`] afterwards fails with
    /// [`Error::ObjectDisposed`].
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(proxy_id = self.proxy_id, contract = %self.contract, "disposing proxy");
        if self.registered {
            self.lifetimes.unregister_proxy(self.proxy_id);
        }
        if !self.channel.is_session_reusable() {
            self.channel.disconnect(&self.session).await?;
        }
        Ok(())
    }
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            // The session (if owned) cannot be disconnected from here;
            // at least drop the registration.
            warn!(proxy_id = self.proxy_id, contract = %self.contract,
                "proxy dropped without dispose");
            if self.registered {
                self.lifetimes.unregister_proxy(self.proxy_id);
            }
        }
    }
}

fn wrap_transport(err: Error) -> Error {
    match err {
        Error::Timeout(_) | Error::RemoteInvocation(_) => err,
        other => Error::RemoteInvocation(InvocationFault::new(
            FaultKind::TransportFailed,
            other.to_string(),
        )),
    }
}

/// Non-blocking handle to a proxy creation in flight.
///
/// Consumed by [`ProxyFactory::end_create`]; being a by-value handle,
/// completing it twice is unrepresentable.
pub struct PendingProxy {
    factory_id: u64,
    join: JoinHandle<Result<Arc<RemoteProxy>>>,
}

/// Creates proxies for one contract over one channel.
pub struct ProxyFactory {
    contract: String,
    endpoint: String,
    channel: Arc<dyn Channel>,
    registry: Arc<ContractRegistry>,
    lifetimes: Arc<LifetimeManager>,
    invoke_mode: InvokeMode,
    factory_id: u64,
    create_gate: Arc<Semaphore>,
    shared_session: Mutex<Option<SessionId>>,
}

impl ProxyFactory {
    /// Create a factory for `contract`, connecting to `endpoint` over
    /// `channel`. At most one `begin_create` runs at a time by default;
    /// see [`ProxyFactory::with_max_concurrent_creations`].
    pub fn new(
        contract: impl Into<String>,
        endpoint: impl Into<String>,
        channel: Arc<dyn Channel>,
        registry: Arc<ContractRegistry>,
        lifetimes: Arc<LifetimeManager>,
    ) -> Self {
        Self {
            contract: contract.into(),
            endpoint: endpoint.into(),
            channel,
            registry,
            lifetimes,
            invoke_mode: InvokeMode::RequestService,
            factory_id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            create_gate: Arc::new(Semaphore::new(1)),
            shared_session: Mutex::new(None),
        }
    }

    /// Allow up to `limit` concurrent proxy creations.
    pub fn with_max_concurrent_creations(mut self, limit: usize) -> Self {
        self.create_gate = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Produce callback proxies (server-to-client direction) instead of
    /// service proxies.
    pub fn with_invoke_mode(mut self, mode: InvokeMode) -> Self {
        self.invoke_mode = mode;
        self
    }

    /// Create a proxy, connecting a session first when needed.
    ///
    /// # Errors
    ///
    /// The contract must be registered client-side; connection failures
    /// propagate from the channel.
    #[instrument(skip(self), fields(contract = %self.contract))]
    pub async fn create_proxy(&self) -> Result<Arc<RemoteProxy>> {
        let descriptor = self.registry.client_descriptor(&self.contract).ok_or_else(|| {
            Error::from(RegistrationError::ContractNotRegistered(
                self.contract.clone(),
            ))
        })?;

        let session = if self.channel.is_session_reusable() {
            let existing = self.shared_session.lock().clone();
            match existing {
                Some(session) => session,
                None => {
                    let session = self.channel.connect(&self.endpoint).await?;
                    *self.shared_session.lock() = Some(session.clone());
                    session
                }
            }
        } else {
            self.channel.connect(&self.endpoint).await?
        };

        let proxy_id = NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed);
        let registered = descriptor.contract.lifetime() == LifetimeMode::PerSession;
        if registered {
            self.lifetimes.register_proxy(
                proxy_id,
                self.channel.id(),
                self.contract.clone(),
                session.clone(),
            );
        }
        debug!(proxy_id, session = %session, "created proxy");
        Ok(Arc::new(RemoteProxy {
            proxy_id,
            contract: self.contract.clone(),
            channel: Arc::clone(&self.channel),
            session,
            registry: Arc::clone(&self.registry),
            lifetimes: Arc::clone(&self.lifetimes),
            invoke_mode: self.invoke_mode,
            registered,
            disposed: AtomicBool::new(false),
        }))
    }

    /// Start creating a proxy without blocking the caller. Creations
    /// beyond the configured concurrency wait for the gate inside the
    /// spawned task.
    pub fn begin_create(self: &Arc<Self>) -> PendingProxy {
        let factory = Arc::clone(self);
        let join = tokio::spawn(async move {
            let _permit = factory
                .create_gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::ChannelClosed)?;
            factory.create_proxy().await
        });
        PendingProxy {
            factory_id: self.factory_id,
            join,
        }
    }

    /// Complete a creation started with [`ProxyFactory::begin_create`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidOperation`] when the handle was issued
    /// by a different factory.
    pub async fn end_create(&self, pending: PendingProxy) -> Result<Arc<RemoteProxy>> {
        if pending.factory_id != self.factory_id {
            return Err(Error::InvalidOperation(
                "create handle belongs to a different factory".into(),
            ));
        }
        pending
            .join
            .await
            .map_err(|e| Error::InvalidOperation(format!("proxy creation task failed: {e}")))?
    }
}
