//! Server entry point: binds a contract and its implementation to a
//! channel and pumps the channel's events into the dispatcher.

use crate::channel::{Channel, ChannelEvent};
use crate::contract::{ContractDescription, ServiceImplementation};
use crate::dispatcher::ServiceDispatcher;
use crate::error::{Error, Result};
use crate::lifetime::LifetimeManager;
use crate::message::InvokeMode;
use crate::registry::ContractRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Pump {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Hosts one contract implementation on one channel.
pub struct ServiceFactory {
    contract: ContractDescription,
    implementation: Arc<ServiceImplementation>,
    channel: Arc<dyn Channel>,
    registry: Arc<ContractRegistry>,
    lifetimes: Arc<LifetimeManager>,
    dispatcher: Arc<ServiceDispatcher>,
    pump: Mutex<Option<Pump>>,
}

impl ServiceFactory {
    /// Create a factory for `contract` served by `implementation`.
    pub fn new(
        contract: ContractDescription,
        implementation: ServiceImplementation,
        channel: Arc<dyn Channel>,
        registry: Arc<ContractRegistry>,
        lifetimes: Arc<LifetimeManager>,
    ) -> Self {
        let dispatcher = Arc::new(ServiceDispatcher::new(
            Arc::clone(&channel),
            Arc::clone(&registry),
            Arc::clone(&lifetimes),
            InvokeMode::RequestService,
        ));
        Self {
            contract,
            implementation: Arc::new(implementation),
            channel,
            registry,
            lifetimes,
            dispatcher,
            pump: Mutex::new(None),
        }
    }

    /// Contract name this factory serves.
    pub fn contract_name(&self) -> &str {
        self.contract.name()
    }

    /// Register the contract and start processing inbound messages.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateRegistration` when the contract is already
    /// registered on the service side, and with
    /// [`Error::InvalidOperation`] when this factory is already open.
    pub fn open(&self) -> Result<()> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Err(Error::InvalidOperation(format!(
                "service for contract '{}' is already open",
                self.contract.name()
            )));
        }
        self.registry.register_channel(self.channel.id());
        self.registry.register_service_contract(
            self.contract.clone(),
            Some(Arc::clone(&self.implementation)),
        )?;

        let events = self.channel.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(pump_events(
            events,
            shutdown_rx,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.lifetimes),
            self.channel.id().to_string(),
        ));
        *pump = Some(Pump { shutdown_tx, join });
        info!(contract = %self.contract.name(), channel = %self.channel.id(), "service opened");
        Ok(())
    }

    /// Stop processing, unregister the contract and dispose its
    /// session-scoped instances on this channel.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidOperation`] when the factory is not
    /// open.
    pub async fn close(&self) -> Result<()> {
        let pump = self.pump.lock().take().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "service for contract '{}' is not open",
                self.contract.name()
            ))
        })?;
        let _ = pump.shutdown_tx.send(());
        let _ = pump.join.await;

        self.registry.unregister_service_contract(self.contract.name());
        self.lifetimes
            .unregister_contract(self.channel.id(), self.contract.name());
        info!(contract = %self.contract.name(), "service closed");
        Ok(())
    }
}

/// Fan channel events out to the dispatcher. One task per inbound
/// message, as the delivery mechanism dictates the concurrency.
async fn pump_events(
    mut events: broadcast::Receiver<ChannelEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    dispatcher: Arc<ServiceDispatcher>,
    lifetimes: Arc<LifetimeManager>,
    channel_id: String,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChannelEvent::MessageReceived { session, message }) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        dispatcher.handle_receive(session, message).await;
                    });
                }
                Ok(ChannelEvent::SessionStateChanged { session, connected }) => {
                    if connected {
                        debug!(session = %session, "session connected");
                    } else {
                        // Cleanup must finish before further events are
                        // processed for this session.
                        lifetimes.session_disconnected(&channel_id, &session);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged behind channel events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("channel event stream closed");
                    break;
                }
            },
            _ = &mut shutdown_rx => {
                debug!("service pump shutdown requested");
                break;
            }
        }
    }
}
