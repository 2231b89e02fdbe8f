//! Contract metadata and per-contract dispatch tables.
//!
//! A contract is a named set of remotely invocable operations. Instead of
//! resolving methods reflectively at call time, each service-side
//! implementation registers a dispatch table up front: a map from
//! [`MethodKey`] (method name plus ordered parameter-type names) to a
//! type-erased async invoker closure. The dispatcher only ever does a
//! table lookup on the hot path.

use crate::channel::{Channel, SessionId};
use crate::error::{FaultKind, InvocationFault, RegistrationError, Result};
use crate::message::MethodParameter;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default call/return timeout for operations that do not override it.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Policy governing how many service instances exist and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifetimeMode {
    /// One instance for the contract's whole process lifetime, created
    /// lazily and never released.
    Singleton,
    /// A fresh instance per inbound call, disposed right after the
    /// response is sent.
    SingleCall,
    /// One instance per (channel, session, proxy) tuple, disposed when
    /// the session disconnects.
    PerSession,
}

/// Which side of the channel an operation executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationDirection {
    /// Invoked by clients, executed by the service.
    ServerSide,
    /// Invoked by the service as a callback, executed by the client.
    ClientSide,
}

/// Per-method metadata. Immutable once attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// Execution side of the operation.
    pub direction: OperationDirection,
    /// One-way operations expect nothing back, not even an acknowledge.
    pub one_way: bool,
    /// Reliable operations round-trip a response; unreliable ones are
    /// sent as datagrams and only acknowledged.
    pub reliable: bool,
    /// How long the caller waits for the round trip. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// How long the service side may spend sending the reply.
    pub return_timeout: Option<Duration>,
    /// Whether concurrent executions of this operation are allowed.
    /// When `false`, calls serialize through the implementation's
    /// execution lock.
    pub allow_parallel_execution: bool,
}

impl Default for OperationDescriptor {
    fn default() -> Self {
        Self {
            direction: OperationDirection::ServerSide,
            one_way: false,
            reliable: true,
            call_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            return_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            allow_parallel_execution: true,
        }
    }
}

impl OperationDescriptor {
    /// Descriptor for a one-way operation.
    pub fn one_way() -> Self {
        Self {
            one_way: true,
            ..Self::default()
        }
    }

    /// Override the call timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the return timeout.
    pub fn with_return_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.return_timeout = timeout;
        self
    }

    /// Mark the operation as non-parallel.
    pub fn serialized(mut self) -> Self {
        self.allow_parallel_execution = false;
        self
    }
}

/// Identity of one operation: method name plus ordered parameter-type
/// names. Overload resolution is an exact-signature table lookup, no
/// widening or scoring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Method name.
    pub name: String,
    /// Ordered textual parameter-type names.
    pub parameter_types: Vec<String>,
}

impl MethodKey {
    /// Create a key from a name and parameter-type names.
    pub fn new<I, S>(name: impl Into<String>, parameter_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            parameter_types: parameter_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Key matching the types carried by a parameter list.
    pub fn for_parameters(name: impl Into<String>, parameters: &[MethodParameter]) -> Self {
        Self {
            name: name.into(),
            parameter_types: parameters.iter().map(|p| p.type_name.clone()).collect(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.parameter_types.join(", "))
    }
}

/// Immutable description of a contract: its identity, lifetime mode and
/// declared operations.
#[derive(Debug, Clone)]
pub struct ContractDescription {
    name: String,
    lifetime: LifetimeMode,
    operations: HashMap<MethodKey, OperationDescriptor>,
}

impl ContractDescription {
    /// Start describing a contract.
    pub fn new(name: impl Into<String>, lifetime: LifetimeMode) -> Self {
        Self {
            name: name.into(),
            lifetime,
            operations: HashMap::new(),
        }
    }

    /// Declare an operation with its metadata.
    pub fn operation<I, S>(
        mut self,
        name: impl Into<String>,
        parameter_types: I,
        descriptor: OperationDescriptor,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations
            .insert(MethodKey::new(name, parameter_types), descriptor);
        self
    }

    /// Contract name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifetime mode of service instances for this contract.
    pub fn lifetime(&self) -> LifetimeMode {
        self.lifetime
    }

    /// Declared operations.
    pub fn operations(&self) -> &HashMap<MethodKey, OperationDescriptor> {
        &self.operations
    }

    /// Metadata for one operation.
    pub fn descriptor(&self, key: &MethodKey) -> Option<&OperationDescriptor> {
        self.operations.get(key)
    }

    /// Check the contract exposes only well-formed operations.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RegistrationError::InvalidOperation {
                contract: self.name.clone(),
                operation: String::new(),
                reason: "contract name must not be empty".into(),
            }
            .into());
        }
        for key in self.operations.keys() {
            if key.name.is_empty() {
                return Err(RegistrationError::InvalidOperation {
                    contract: self.name.clone(),
                    operation: key.to_string(),
                    reason: "operation name must not be empty".into(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Handle to a live service object, type-erased.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

type EmptyActivator = Arc<dyn Fn() -> Result<ServiceHandle> + Send + Sync>;
type SessionActivator =
    Arc<dyn Fn(Arc<dyn Channel>, SessionId) -> Result<ServiceHandle> + Send + Sync>;
type Disposer = Arc<dyn Fn(&ServiceHandle) + Send + Sync>;
type ErasedInvoker = Arc<
    dyn Fn(ServiceHandle, Vec<MethodParameter>) -> BoxFuture<'static, Result<Bytes>> + Send + Sync,
>;

/// How a service instance gets constructed.
#[derive(Clone)]
pub(crate) enum ServiceActivator {
    /// Empty constructor, for `Singleton` and `SingleCall` contracts.
    Empty(EmptyActivator),
    /// `(channel, session)` constructor, for `PerSession` contracts.
    PerSession(SessionActivator),
}

/// One entry of a dispatch table: the erased invoker plus the textual
/// name of the value it returns.
#[derive(Clone)]
pub struct ServiceMethod {
    pub(crate) return_type: String,
    pub(crate) invoke: ErasedInvoker,
}

/// Server-side implementation of a contract: activator, disposer and the
/// dispatch table built at registration time.
#[derive(Clone)]
pub struct ServiceImplementation {
    type_name: String,
    activator: ServiceActivator,
    disposer: Disposer,
    methods: HashMap<MethodKey, ServiceMethod>,
    execution_lock: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for ServiceImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceImplementation")
            .field("type_name", &self.type_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ServiceImplementation {
    /// Start building an implementation of type `T`.
    pub fn builder<T: Send + Sync + 'static>(
        type_name: impl Into<String>,
    ) -> ServiceImplementationBuilder<T> {
        ServiceImplementationBuilder {
            type_name: type_name.into(),
            activator: None,
            disposer: None,
            methods: HashMap::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Implementation type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The dispatch-table entry for one operation.
    pub(crate) fn method(&self, key: &MethodKey) -> Option<&ServiceMethod> {
        self.methods.get(key)
    }

    /// Keys of all registered methods.
    pub(crate) fn method_keys(&self) -> impl Iterator<Item = &MethodKey> {
        self.methods.keys()
    }

    /// Whether the activator shape fits the given lifetime mode.
    pub(crate) fn supports_lifetime(&self, lifetime: LifetimeMode) -> bool {
        match (&self.activator, lifetime) {
            (ServiceActivator::PerSession(_), LifetimeMode::PerSession) => true,
            (ServiceActivator::Empty(_), LifetimeMode::Singleton | LifetimeMode::SingleCall) => {
                true
            }
            _ => false,
        }
    }

    /// Construct a service object. `session` must be supplied for
    /// `PerSession` activators and absent otherwise.
    pub(crate) fn activate(
        &self,
        session: Option<(Arc<dyn Channel>, SessionId)>,
    ) -> std::result::Result<ServiceHandle, InvocationFault> {
        let constructed = match (&self.activator, session) {
            (ServiceActivator::Empty(activate), None) => activate(),
            (ServiceActivator::PerSession(activate), Some((channel, session))) => {
                activate(channel, session)
            }
            (ServiceActivator::Empty(_), Some(_)) => {
                return Err(InvocationFault::new(
                    FaultKind::ConstructionFailed,
                    format!("'{}' has no session-scoped constructor", self.type_name),
                ));
            }
            (ServiceActivator::PerSession(_), None) => {
                return Err(InvocationFault::new(
                    FaultKind::ConstructionFailed,
                    format!("'{}' requires a session-scoped constructor", self.type_name),
                ));
            }
        };
        constructed.map_err(|e| InvocationFault::new(FaultKind::ConstructionFailed, e.to_string()))
    }

    /// Dispose hook registered for this implementation.
    pub(crate) fn disposer(&self) -> Disposer {
        Arc::clone(&self.disposer)
    }

    /// Lock serializing operations with `allow_parallel_execution == false`.
    pub(crate) fn execution_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.execution_lock)
    }
}

/// Typed builder producing a type-erased [`ServiceImplementation`].
pub struct ServiceImplementationBuilder<T> {
    type_name: String,
    activator: Option<ServiceActivator>,
    disposer: Option<Disposer>,
    methods: HashMap<MethodKey, ServiceMethod>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ServiceImplementationBuilder<T> {
    /// Use an empty constructor (Singleton and SingleCall contracts).
    pub fn activate<F>(mut self, construct: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.activator = Some(ServiceActivator::Empty(Arc::new(move || {
            construct().map(|instance| Arc::new(instance) as ServiceHandle)
        })));
        self
    }

    /// Use a `(channel, session)` constructor (PerSession contracts).
    pub fn activate_per_session<F>(mut self, construct: F) -> Self
    where
        F: Fn(Arc<dyn Channel>, SessionId) -> Result<T> + Send + Sync + 'static,
    {
        self.activator = Some(ServiceActivator::PerSession(Arc::new(
            move |channel, session| {
                construct(channel, session).map(|instance| Arc::new(instance) as ServiceHandle)
            },
        )));
        self
    }

    /// Register a hook invoked when an instance is disposed.
    pub fn dispose<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.disposer = Some(Arc::new(move |handle: &ServiceHandle| {
            if let Some(instance) = handle.downcast_ref::<T>() {
                hook(instance);
            }
        }));
        self
    }

    /// Register the invoker for one operation.
    ///
    /// The closure receives the typed instance and the raw parameters and
    /// returns the serialized return value, or a fault carried back to
    /// the caller.
    pub fn method<I, S, F, Fut>(
        mut self,
        name: impl Into<String>,
        parameter_types: I,
        return_type: impl Into<String>,
        invoke: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Arc<T>, Vec<MethodParameter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let key = MethodKey::new(name, parameter_types);
        let invoke = Arc::new(invoke);
        let erased: ErasedInvoker = Arc::new(move |handle: ServiceHandle, parameters| {
            let invoke = Arc::clone(&invoke);
            match handle.downcast::<T>() {
                Ok(typed) => invoke(typed, parameters).boxed(),
                Err(_) => futures::future::ready(Err(InvocationFault::new(
                    FaultKind::MethodFailed,
                    "service instance has an unexpected implementation type",
                )
                .into()))
                .boxed(),
            }
        });
        self.methods.insert(
            key,
            ServiceMethod {
                return_type: return_type.into(),
                invoke: erased,
            },
        );
        self
    }

    /// Finish the implementation.
    ///
    /// # Errors
    ///
    /// Fails when no activator was supplied.
    pub fn build(self) -> Result<ServiceImplementation> {
        let activator = self.activator.ok_or_else(|| {
            RegistrationError::InvalidImplementation {
                contract: String::new(),
                type_name: self.type_name.clone(),
                reason: "no constructor registered".into(),
            }
        })?;
        Ok(ServiceImplementation {
            type_name: self.type_name,
            activator,
            disposer: self.disposer.unwrap_or_else(|| Arc::new(|_| {})),
            methods: self.methods,
            execution_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }
}
