//! Remote method invocation core over an abstract message channel.
//!
//! This crate implements the protocol layer that lets a client-side
//! proxy invoke a method on a server-side object across a bidirectional
//! channel: request/response correlation, per-method timeouts, pluggable
//! object lifetime modes and automatic or manual reply dispatch. The
//! wire transport and payload formats stay outside; anything that can
//! implement [`Channel`] plugs in.
//!
//! # Features
//!
//! - **Typed envelopes**: request/response/acknowledge/datagram messages
//!   correlated by id, with a call context map
//! - **Dispatch tables**: per-contract method tables built at
//!   registration, no reflection on the hot path
//! - **Lifetime modes**: `Singleton`, `SingleCall` and `PerSession`
//!   service instances tracked by a lifetime manager
//! - **Manual replies**: a service method can defer its response and
//!   send it explicitly later
//!
//! # Example
//!
//! ```no_run
//! use remoting_core::{
//!     ContractDescription, ContractRegistry, LifetimeMode, LifetimeManager,
//!     OperationDescriptor, ProxyFactory, ServiceFactory, ServiceImplementation,
//!     formatter, memory::memory_pair, MethodParameter,
//! };
//! use std::sync::Arc;
//!
//! struct EchoService;
//!
//! # async fn example() -> remoting_core::Result<()> {
//! let (client_end, server_end) = memory_pair("mem", true);
//! let registry = Arc::new(ContractRegistry::new());
//! let lifetimes = Arc::new(LifetimeManager::new());
//!
//! let contract = ContractDescription::new("Echo", LifetimeMode::SingleCall)
//!     .operation("Say", ["String"], OperationDescriptor::default());
//! let implementation = ServiceImplementation::builder::<EchoService>("EchoService")
//!     .activate(|| Ok(EchoService))
//!     .method("Say", ["String"], "String", |_svc, params| async move {
//!         let text: String = formatter::decode(&params[0].value)?;
//!         formatter::encode(&text)
//!     })
//!     .build()?;
//!
//! let service = ServiceFactory::new(
//!     contract.clone(), implementation, server_end, registry.clone(), lifetimes.clone());
//! service.open()?;
//!
//! registry.register_client_contract(contract, Some("mem".into()))?;
//! let factory = ProxyFactory::new("Echo", "local", client_end, registry, lifetimes);
//! let proxy = factory.create_proxy().await?;
//! let reply = proxy
//!     .invoke("Say", vec![MethodParameter::new(0, "String", formatter::encode(&"hi")?)])
//!     .await?;
//! let text: String = formatter::decode(&reply)?;
//! assert_eq!(text, "hi");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod formatter;
pub mod lifetime;
pub mod memory;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod reply;
pub mod service;

// Re-export commonly used types
pub use channel::{Channel, ChannelEvent, SessionId};
pub use contract::{
    ContractDescription, LifetimeMode, MethodKey, OperationDescriptor, OperationDirection,
    ServiceImplementation,
};
pub use dispatcher::ServiceDispatcher;
pub use error::{Error, FaultKind, InvocationFault, Result};
pub use lifetime::{InstanceKey, LifetimeManager, ServiceInstance};
pub use message::{InvokeMode, Message, MessageKind, MethodParameter, PROXY_ID_KEY};
pub use proxy::{PendingProxy, ProxyFactory, RemoteProxy};
pub use registry::ContractRegistry;
pub use reply::send_response_manually;
pub use service::ServiceFactory;
