//! The contract registry: authoritative mapping from contract identity to
//! client/service descriptors and per-channel implementations.
//!
//! All mutation is serialized through one lock per registry instance so a
//! concurrent registration race can never publish a partial descriptor.
//! Every mutating call is all-or-nothing: validation happens before any
//! table is touched.

use crate::contract::{
    ContractDescription, MethodKey, OperationDescriptor, ServiceImplementation,
};
use crate::error::{RegistrationError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Client-side view of a contract: operation metadata plus the channel a
/// proxy binds to by default.
#[derive(Debug, Clone)]
pub struct ClientSideDescriptor {
    /// The contract description.
    pub contract: ContractDescription,
    /// Channel id proxies use when none is named explicitly.
    pub default_channel_id: Option<String>,
}

/// Service-side view of a contract: the default implementation and any
/// per-channel overrides.
#[derive(Debug, Clone)]
pub struct ServiceSideDescriptor {
    /// The contract description.
    pub contract: ContractDescription,
    /// Implementation used when the inbound channel has no override.
    pub default_implementation: Option<Arc<ServiceImplementation>>,
    /// Per-channel implementation overrides, unique per channel id.
    pub implementation_per_channel: HashMap<String, Arc<ServiceImplementation>>,
}

impl ServiceSideDescriptor {
    /// Resolve the implementation for an inbound channel: per-channel
    /// mapping first, else the contract default.
    pub fn implementation_for(&self, channel_id: &str) -> Option<Arc<ServiceImplementation>> {
        self.implementation_per_channel
            .get(channel_id)
            .or(self.default_implementation.as_ref())
            .cloned()
    }
}

#[derive(Default)]
struct RegistryState {
    channels: HashSet<String>,
    service: HashMap<String, ServiceSideDescriptor>,
    client: HashMap<String, ClientSideDescriptor>,
}

/// Registry of contracts known to one remoting stack.
#[derive(Default)]
pub struct ContractRegistry {
    state: Mutex<RegistryState>,
}

impl ContractRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a channel known to the registry. Idempotent.
    pub fn register_channel(&self, channel_id: impl Into<String>) {
        self.state.lock().channels.insert(channel_id.into());
    }

    /// Forget a channel and purge its per-contract implementation
    /// mappings.
    pub fn unregister_channel(&self, channel_id: &str) {
        let mut state = self.state.lock();
        state.channels.remove(channel_id);
        for descriptor in state.service.values_mut() {
            descriptor.implementation_per_channel.remove(channel_id);
        }
    }

    /// Whether a channel is known.
    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.state.lock().channels.contains(channel_id)
    }

    /// Register a contract on the service side with an optional default
    /// implementation.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateRegistration` when the contract already has a
    /// service-side descriptor, and with a validation error when the
    /// implementation does not satisfy the contract. A failed call leaves
    /// the registry unchanged.
    pub fn register_service_contract(
        &self,
        contract: ContractDescription,
        default_implementation: Option<Arc<ServiceImplementation>>,
    ) -> Result<()> {
        contract.validate()?;
        if let Some(implementation) = &default_implementation {
            validate_implementation(&contract, implementation)?;
        }
        let mut state = self.state.lock();
        if state.service.contains_key(contract.name()) {
            return Err(
                RegistrationError::DuplicateRegistration(contract.name().to_string()).into(),
            );
        }
        state.service.insert(
            contract.name().to_string(),
            ServiceSideDescriptor {
                contract,
                default_implementation,
                implementation_per_channel: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove a contract's service-side descriptor, returning it.
    pub fn unregister_service_contract(&self, contract: &str) -> Option<ServiceSideDescriptor> {
        self.state.lock().service.remove(contract)
    }

    /// Register a contract on the client side.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateRegistration` when already present and with
    /// `ChannelNotFound` when the named default channel is unknown.
    pub fn register_client_contract(
        &self,
        contract: ContractDescription,
        default_channel_id: Option<String>,
    ) -> Result<()> {
        contract.validate()?;
        let mut state = self.state.lock();
        if state.client.contains_key(contract.name()) {
            return Err(
                RegistrationError::DuplicateRegistration(contract.name().to_string()).into(),
            );
        }
        if let Some(channel_id) = &default_channel_id
            && !state.channels.contains(channel_id)
        {
            return Err(RegistrationError::ChannelNotFound(channel_id.clone()).into());
        }
        state.client.insert(
            contract.name().to_string(),
            ClientSideDescriptor {
                contract,
                default_channel_id,
            },
        );
        Ok(())
    }

    /// Remove a contract's client-side descriptor, returning it.
    pub fn unregister_client_contract(&self, contract: &str) -> Option<ClientSideDescriptor> {
        self.state.lock().client.remove(contract)
    }

    /// Install, overwrite or remove (`None`) the implementation used for
    /// one channel.
    ///
    /// # Errors
    ///
    /// The contract must already be registered and the channel known.
    pub fn register_implementation_for_channel(
        &self,
        contract: &str,
        channel_id: &str,
        implementation: Option<Arc<ServiceImplementation>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.channels.contains(channel_id) {
            return Err(RegistrationError::ChannelNotFound(channel_id.to_string()).into());
        }
        let descriptor = state
            .service
            .get_mut(contract)
            .ok_or_else(|| RegistrationError::ContractNotRegistered(contract.to_string()))?;
        if let Some(implementation) = &implementation {
            validate_implementation(&descriptor.contract, implementation)?;
        }
        match implementation {
            Some(implementation) => {
                descriptor
                    .implementation_per_channel
                    .insert(channel_id.to_string(), implementation);
            }
            None => {
                descriptor.implementation_per_channel.remove(channel_id);
            }
        }
        Ok(())
    }

    /// Read a contract's service-side descriptor.
    pub fn service_descriptor(&self, contract: &str) -> Option<ServiceSideDescriptor> {
        self.state.lock().service.get(contract).cloned()
    }

    /// Read a contract's client-side descriptor.
    pub fn client_descriptor(&self, contract: &str) -> Option<ClientSideDescriptor> {
        self.state.lock().client.get(contract).cloned()
    }

    /// Replace a contract's service-side defaults; adds the descriptor
    /// when missing instead of merging into an existing one.
    ///
    /// # Errors
    ///
    /// Fails when the contract or implementation is malformed.
    pub fn change_service_defaults(
        &self,
        contract: ContractDescription,
        default_implementation: Option<Arc<ServiceImplementation>>,
    ) -> Result<()> {
        contract.validate()?;
        if let Some(implementation) = &default_implementation {
            validate_implementation(&contract, implementation)?;
        }
        let mut state = self.state.lock();
        let per_channel = state
            .service
            .remove(contract.name())
            .map(|d| d.implementation_per_channel)
            .unwrap_or_default();
        state.service.insert(
            contract.name().to_string(),
            ServiceSideDescriptor {
                contract,
                default_implementation,
                implementation_per_channel: per_channel,
            },
        );
        Ok(())
    }

    /// Replace a contract's client-side defaults; adds the descriptor
    /// when missing instead of merging into an existing one.
    ///
    /// # Errors
    ///
    /// Fails when the contract is malformed or the named default channel
    /// is unknown. A failed call leaves the registry unchanged.
    pub fn change_client_defaults(
        &self,
        contract: ContractDescription,
        default_channel_id: Option<String>,
    ) -> Result<()> {
        contract.validate()?;
        let mut state = self.state.lock();
        if let Some(channel_id) = &default_channel_id
            && !state.channels.contains(channel_id)
        {
            return Err(RegistrationError::ChannelNotFound(channel_id.clone()).into());
        }
        state.client.insert(
            contract.name().to_string(),
            ClientSideDescriptor {
                contract,
                default_channel_id,
            },
        );
        Ok(())
    }

    /// Operation metadata as seen by a client proxy.
    pub fn client_operation(&self, contract: &str, key: &MethodKey) -> Option<OperationDescriptor> {
        self.state
            .lock()
            .client
            .get(contract)
            .and_then(|d| d.contract.descriptor(key).cloned())
    }

    /// Operation metadata as seen by the service dispatcher.
    pub fn service_operation(
        &self,
        contract: &str,
        key: &MethodKey,
    ) -> Option<OperationDescriptor> {
        self.state
            .lock()
            .service
            .get(contract)
            .and_then(|d| d.contract.descriptor(key).cloned())
    }
}

/// An implementation satisfies a contract when every table entry matches
/// a declared operation and every declared server-side operation has a
/// table entry.
fn validate_implementation(
    contract: &ContractDescription,
    implementation: &ServiceImplementation,
) -> Result<()> {
    if !implementation.supports_lifetime(contract.lifetime()) {
        return Err(RegistrationError::InvalidImplementation {
            contract: contract.name().to_string(),
            type_name: implementation.type_name().to_string(),
            reason: format!(
                "constructor shape does not fit lifetime mode {:?}",
                contract.lifetime()
            ),
        }
        .into());
    }
    for key in implementation.method_keys() {
        if contract.descriptor(key).is_none() {
            return Err(RegistrationError::InvalidImplementation {
                contract: contract.name().to_string(),
                type_name: implementation.type_name().to_string(),
                reason: format!("undeclared operation {key}"),
            }
            .into());
        }
    }
    for (key, descriptor) in contract.operations() {
        if descriptor.direction == crate::contract::OperationDirection::ServerSide
            && implementation.method(key).is_none()
        {
            return Err(RegistrationError::InvalidImplementation {
                contract: contract.name().to_string(),
                type_name: implementation.type_name().to_string(),
                reason: format!("missing operation {key}"),
            }
            .into());
        }
    }
    Ok(())
}
