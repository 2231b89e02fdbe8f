//! The service dispatcher: receives inbound request messages, resolves
//! the target instance and method, invokes it and sends the response.
//!
//! [`ServiceDispatcher::handle_receive`] is invoked from the channel's
//! message-delivery path, so nothing is allowed to escape it: failures
//! that owe a response become error responses carrying an
//! [`InvocationFault`]; everything else is logged and dropped.

use crate::channel::{Channel, SessionId};
use crate::contract::{LifetimeMode, MethodKey, ServiceImplementation};
use crate::error::{Error, FaultKind, InvocationFault};
use crate::lifetime::{InstanceKey, LifetimeManager, ServiceInstance};
use crate::message::{InvokeMode, Message, MessageKind, RequestBody};
use crate::registry::ContractRegistry;
use crate::reply::{CallContextForReply, REPLY_CONTEXT, ReplyCell, send_with_timeout};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Server-side dispatcher bound to one channel.
///
/// Reentrant and stateless apart from the shared registries; any number
/// of deliveries may run through it concurrently.
pub struct ServiceDispatcher {
    channel: Arc<dyn Channel>,
    registry: Arc<ContractRegistry>,
    lifetimes: Arc<LifetimeManager>,
    mode: InvokeMode,
}

impl ServiceDispatcher {
    /// Create a dispatcher processing requests of the given invoke mode.
    /// A service dispatcher takes [`InvokeMode::RequestService`]; a
    /// client-side callback dispatcher takes
    /// [`InvokeMode::RequestCallback`].
    pub fn new(
        channel: Arc<dyn Channel>,
        registry: Arc<ContractRegistry>,
        lifetimes: Arc<LifetimeManager>,
        mode: InvokeMode,
    ) -> Self {
        Self {
            channel,
            registry,
            lifetimes,
            mode,
        }
    }

    /// Handle one inbound message. Never returns an error; see the
    /// module docs for the propagation policy.
    #[instrument(skip(self, message), fields(session = %session, correlation_id = %message.correlation_id()))]
    pub async fn handle_receive(&self, session: SessionId, message: Message) {
        let kind = message.kind();
        if matches!(kind, MessageKind::Response | MessageKind::Acknowledge) {
            // Implementation error on the peer: a dispatcher never
            // expects these.
            warn!(kind = %kind, "dropping unexpected message kind");
            return;
        }
        let Some(body) = message.request_body() else {
            warn!(kind = %kind, "dropping message without request body");
            return;
        };
        if body.invoke_mode != self.mode {
            // Belongs to the other dispatcher sharing this channel.
            debug!(mode = ?body.invoke_mode, "skipping request for other invoke mode");
            return;
        }

        if let Err(fault) = self.process(&session, &message, body).await {
            if kind == MessageKind::Request {
                self.send_error_response(&session, message.correlation_id(), fault)
                    .await;
            } else {
                warn!(fault = %fault, "datagram handling failed");
            }
        }
    }

    /// Run the request through contract, instance and method resolution,
    /// invocation and the response path.
    async fn process(
        &self,
        session: &SessionId,
        message: &Message,
        body: &RequestBody,
    ) -> Result<(), InvocationFault> {
        let descriptor = self
            .registry
            .service_descriptor(&body.contract_name)
            .ok_or_else(|| {
                InvocationFault::new(
                    FaultKind::ContractNotRegistered,
                    format!("contract '{}' is not registered", body.contract_name),
                )
            })?;
        let implementation = descriptor
            .implementation_for(self.channel.id())
            .ok_or_else(|| {
                InvocationFault::new(
                    FaultKind::ImplementationMissing,
                    format!(
                        "contract '{}' has no implementation for channel '{}'",
                        body.contract_name,
                        self.channel.id()
                    ),
                )
            })?;

        for (position, parameter) in body.parameters.iter().enumerate() {
            if parameter.index != position {
                return Err(InvocationFault::for_parameter(
                    FaultKind::ParameterUnresolved,
                    format!("parameter {position}"),
                    format!("carries index {} at position {position}", parameter.index),
                ));
            }
        }

        let lifetime = descriptor.contract.lifetime();
        let instance = self.resolve_instance(session, message, body, lifetime, &implementation)?;

        let result = self
            .run_method(session, message, body, &descriptor.contract, &implementation, &instance)
            .await;

        // SingleCall instances never outlive their one invocation.
        if lifetime == LifetimeMode::SingleCall {
            instance.dispose();
        }
        result
    }

    fn resolve_instance(
        &self,
        session: &SessionId,
        message: &Message,
        body: &RequestBody,
        lifetime: LifetimeMode,
        implementation: &Arc<ServiceImplementation>,
    ) -> Result<ServiceInstance, InvocationFault> {
        match lifetime {
            LifetimeMode::PerSession => {
                let proxy_id = message.header.proxy_id().ok_or_else(|| {
                    InvocationFault::new(
                        FaultKind::ConstructionFailed,
                        "per-session request carries no proxy id",
                    )
                })?;
                let key = InstanceKey {
                    channel_id: self.channel.id().to_string(),
                    contract: body.contract_name.clone(),
                    session: session.clone(),
                    implementation: implementation.type_name().to_string(),
                    proxy_id,
                };
                let channel = Arc::clone(&self.channel);
                let session = session.clone();
                let implementation = Arc::clone(implementation);
                self.lifetimes.resolve_session_instance(key, move || {
                    implementation
                        .activate(Some((channel, session)))
                        .map(|handle| ServiceInstance::new(handle, implementation.disposer()))
                })
            }
            LifetimeMode::Singleton => {
                let type_name = implementation.type_name().to_string();
                let implementation = Arc::clone(implementation);
                self.lifetimes
                    .singleton(&type_name, move || {
                        implementation
                            .activate(None)
                            .map(|handle| ServiceInstance::new(handle, implementation.disposer()))
                    })
            }
            LifetimeMode::SingleCall => implementation
                .activate(None)
                .map(|handle| ServiceInstance::new(handle, implementation.disposer())),
        }
    }

    async fn run_method(
        &self,
        session: &SessionId,
        message: &Message,
        body: &RequestBody,
        contract: &crate::contract::ContractDescription,
        implementation: &Arc<ServiceImplementation>,
        instance: &ServiceInstance,
    ) -> Result<(), InvocationFault> {
        let key = MethodKey::for_parameters(&body.method_name, &body.parameters);
        let method = implementation
            .method(&key)
            .ok_or_else(|| method_miss_fault(implementation, &key))?
            .clone();
        let operation = contract
            .descriptor(&key)
            .cloned()
            .unwrap_or_default();

        // Serialize non-parallel operations through the implementation's
        // execution lock.
        let lock = (!operation.allow_parallel_execution).then(|| implementation.execution_lock());
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let parameters = body.parameters.clone();
        match message.kind() {
            MessageKind::Request => {
                let cell = ReplyCell::new(CallContextForReply {
                    channel: Arc::clone(&self.channel),
                    session: session.clone(),
                    correlation_id: message.correlation_id().to_string(),
                    return_type: method.return_type.clone(),
                    return_timeout: operation.return_timeout,
                });
                // Install the reply context for the duration of the
                // invocation only; the scope guarantees removal on every
                // exit path.
                let outcome = REPLY_CONTEXT
                    .scope(cell.clone(), (method.invoke)(instance.handle(), parameters))
                    .await;

                match cell.take() {
                    Some(context) => {
                        let (value, fault) = match outcome {
                            Ok(value) => (value, None),
                            Err(e) => (Bytes::new(), Some(error_to_fault(e))),
                        };
                        self.send_response(&context, value, fault).await;
                    }
                    None => {
                        // A manual reply already went out.
                        if let Err(e) = outcome {
                            warn!(error = %e, "method failed after manual reply was sent");
                        }
                    }
                }
                Ok(())
            }
            MessageKind::Datagram => {
                if let Err(e) = (method.invoke)(instance.handle(), parameters).await {
                    warn!(error = %e, "datagram invocation failed");
                }
                match Message::acknowledge(message.correlation_id().to_string()) {
                    Ok(acknowledge) => {
                        if let Err(e) = self.channel.send_one_way(session, acknowledge).await {
                            error!(error = %e, "failed to send acknowledge");
                        }
                    }
                    Err(e) => warn!(error = %e, "cannot build acknowledge"),
                }
                Ok(())
            }
            MessageKind::DatagramOneway => {
                if let Err(e) = (method.invoke)(instance.handle(), parameters).await {
                    warn!(error = %e, "one-way invocation failed");
                }
                Ok(())
            }
            // handle_receive filtered the rest already.
            _ => Ok(()),
        }
    }

    async fn send_response(
        &self,
        context: &CallContextForReply,
        value: Bytes,
        fault: Option<InvocationFault>,
    ) {
        let response = match Message::response(
            context.correlation_id.clone(),
            context.return_type.clone(),
            value,
            fault,
        ) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "failed to build response message");
                return;
            }
        };
        if let Err(e) = send_with_timeout(context, response, context.return_timeout).await {
            // Never let a send failure back into the delivery path.
            error!(error = %e, correlation_id = %context.correlation_id,
                "failed to send response");
        }
    }

    async fn send_error_response(
        &self,
        session: &SessionId,
        correlation_id: &str,
        fault: InvocationFault,
    ) {
        debug!(fault = %fault, "sending error response");
        let context = CallContextForReply {
            channel: Arc::clone(&self.channel),
            session: session.clone(),
            correlation_id: correlation_id.to_string(),
            return_type: String::new(),
            return_timeout: Some(crate::contract::DEFAULT_OPERATION_TIMEOUT),
        };
        self.send_response(&context, Bytes::new(), Some(fault)).await;
    }
}

/// Build the fault for a dispatch-table miss, naming the offending
/// parameter when a same-name overload differs only in one type.
fn method_miss_fault(implementation: &ServiceImplementation, key: &MethodKey) -> InvocationFault {
    let candidates: Vec<&MethodKey> = implementation
        .method_keys()
        .filter(|candidate| candidate.name == key.name)
        .collect();
    if candidates.is_empty() {
        return InvocationFault::new(
            FaultKind::MethodNotFound,
            format!(
                "no method '{}' on '{}'",
                key.name,
                implementation.type_name()
            ),
        );
    }
    for candidate in &candidates {
        if candidate.parameter_types.len() != key.parameter_types.len() {
            continue;
        }
        if let Some(position) = candidate
            .parameter_types
            .iter()
            .zip(&key.parameter_types)
            .position(|(expected, actual)| expected != actual)
        {
            return InvocationFault::for_parameter(
                FaultKind::ParameterUnresolved,
                format!("parameter {position}"),
                format!(
                    "cannot resolve type '{}' (method declares '{}')",
                    key.parameter_types[position], candidate.parameter_types[position]
                ),
            );
        }
    }
    InvocationFault::new(
        FaultKind::MethodNotFound,
        format!("no overload {key} on '{}'", implementation.type_name()),
    )
}

fn error_to_fault(err: Error) -> InvocationFault {
    match err {
        Error::RemoteInvocation(fault) => fault,
        Error::Codec(e) => InvocationFault::new(FaultKind::CodecFailed, e.to_string()),
        other => InvocationFault::method_failed(other),
    }
}
