//! The lifetime manager: single source of truth for which service
//! instances exist.
//!
//! Session-scoped instances are keyed by the full
//! (channel, contract, session, implementation, proxy) tuple and held in
//! a linear-scan table; singletons live in a separate per-type table.
//! Proxies register here too so the service side can learn which remote
//! proxy id to address when calling back.

use crate::channel::SessionId;
use crate::contract::ServiceHandle;
use crate::error::{Error, InvocationFault, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Key identifying one session-scoped service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceKey {
    /// Channel the instance is bound to.
    pub channel_id: String,
    /// Contract the instance serves.
    pub contract: String,
    /// Session the instance belongs to.
    pub session: SessionId,
    /// Implementation type name.
    pub implementation: String,
    /// Identifier of the client proxy that owns the instance.
    pub proxy_id: u64,
}

struct InstanceInner {
    handle: ServiceHandle,
    disposer: Arc<dyn Fn(&ServiceHandle) + Send + Sync>,
    disposed: AtomicBool,
}

/// A live service object together with its dispose hook.
///
/// Disposal runs the hook exactly once no matter how many clones exist
/// or how often `dispose` is called.
#[derive(Clone)]
pub struct ServiceInstance {
    inner: Arc<InstanceInner>,
}

impl ServiceInstance {
    /// Wrap a service handle with its dispose hook.
    pub fn new(handle: ServiceHandle, disposer: Arc<dyn Fn(&ServiceHandle) + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                handle,
                disposer,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The type-erased service object.
    pub fn handle(&self) -> ServiceHandle {
        Arc::clone(&self.inner.handle)
    }

    /// Run the dispose hook; subsequent calls are no-ops.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            (self.inner.disposer)(&self.inner.handle);
        }
    }

    fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct SessionEntry {
    key: InstanceKey,
    instance: ServiceInstance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProxyEntry {
    proxy_id: u64,
    channel_id: String,
    contract: String,
    session: SessionId,
}

/// Tracks live service instances and registered proxies.
#[derive(Default)]
pub struct LifetimeManager {
    sessions: Mutex<Vec<SessionEntry>>,
    singletons: Mutex<HashMap<String, ServiceInstance>>,
    proxies: Mutex<Vec<ProxyEntry>>,
}

impl LifetimeManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session-scoped instance.
    pub fn find(&self, key: &InstanceKey) -> Option<ServiceInstance> {
        self.sessions
            .lock()
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| entry.instance.clone())
    }

    /// Register a session-scoped instance under its key.
    pub fn register(&self, key: InstanceKey, instance: ServiceInstance) {
        self.sessions.lock().push(SessionEntry { key, instance });
    }

    /// Remove a session-scoped instance by identity, without disposing it.
    pub fn unregister(&self, instance: &ServiceInstance) -> bool {
        let mut table = self.sessions.lock();
        let before = table.len();
        table.retain(|entry| !entry.instance.same_object(instance));
        table.len() != before
    }

    /// Find the instance for `key`, constructing and registering it when
    /// absent. Construction happens under the table lock so two
    /// concurrent first calls cannot both construct.
    pub fn resolve_session_instance(
        &self,
        key: InstanceKey,
        activate: impl FnOnce() -> std::result::Result<ServiceInstance, InvocationFault>,
    ) -> std::result::Result<ServiceInstance, InvocationFault> {
        let mut table = self.sessions.lock();
        if let Some(entry) = table.iter().find(|entry| entry.key == key) {
            return Ok(entry.instance.clone());
        }
        let instance = activate()?;
        debug!(contract = %key.contract, session = %key.session, proxy_id = key.proxy_id,
            "created per-session instance");
        table.push(SessionEntry {
            key,
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Find the singleton for an implementation type, constructing it on
    /// first use. Double-checked under the singleton lock so concurrent
    /// first calls construct exactly once.
    pub fn singleton(
        &self,
        type_name: &str,
        activate: impl FnOnce() -> std::result::Result<ServiceInstance, InvocationFault>,
    ) -> std::result::Result<ServiceInstance, InvocationFault> {
        let mut table = self.singletons.lock();
        if let Some(instance) = table.get(type_name) {
            return Ok(instance.clone());
        }
        let instance = activate()?;
        debug!(type_name, "created singleton instance");
        table.insert(type_name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Remove and dispose every session-scoped instance bound to a
    /// channel, and drop the channel's proxy registrations.
    pub fn unregister_channel(&self, channel_id: &str) {
        let removed = {
            let mut table = self.sessions.lock();
            let mut removed = Vec::new();
            table.retain(|entry| {
                if entry.key.channel_id == channel_id {
                    removed.push(entry.instance.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        // Dispose outside the lock; hooks may call back into the manager.
        for instance in removed {
            instance.dispose();
        }
        self.proxies
            .lock()
            .retain(|entry| entry.channel_id != channel_id);
    }

    /// Remove and dispose every session-scoped instance of one contract
    /// on one channel.
    pub fn unregister_contract(&self, channel_id: &str, contract: &str) {
        let removed = {
            let mut table = self.sessions.lock();
            let mut removed = Vec::new();
            table.retain(|entry| {
                if entry.key.channel_id == channel_id && entry.key.contract == contract {
                    removed.push(entry.instance.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        for instance in removed {
            instance.dispose();
        }
    }

    /// Handle a session disconnect: remove and dispose every instance
    /// bound to that (channel, session) pair, synchronously.
    pub fn session_disconnected(&self, channel_id: &str, session: &SessionId) {
        let removed = {
            let mut table = self.sessions.lock();
            let mut removed = Vec::new();
            table.retain(|entry| {
                if entry.key.channel_id == channel_id && entry.key.session == *session {
                    removed.push(entry.instance.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        if !removed.is_empty() {
            debug!(channel_id, session = %session, count = removed.len(),
                "disposing instances for disconnected session");
        }
        for instance in removed {
            instance.dispose();
        }
    }

    /// Record a client proxy so the service side can address it later.
    pub fn register_proxy(
        &self,
        proxy_id: u64,
        channel_id: impl Into<String>,
        contract: impl Into<String>,
        session: SessionId,
    ) {
        self.proxies.lock().push(ProxyEntry {
            proxy_id,
            channel_id: channel_id.into(),
            contract: contract.into(),
            session,
        });
    }

    /// Drop a proxy registration. Returns whether one was present.
    pub fn unregister_proxy(&self, proxy_id: u64) -> bool {
        let mut table = self.proxies.lock();
        let before = table.len();
        table.retain(|entry| entry.proxy_id != proxy_id);
        table.len() != before
    }

    /// Check a proxy is registered.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ProxyNotRegistered`] when it is not.
    pub fn check_registered(&self, proxy_id: u64) -> Result<()> {
        if self
            .proxies
            .lock()
            .iter()
            .any(|entry| entry.proxy_id == proxy_id)
        {
            Ok(())
        } else {
            Err(Error::ProxyNotRegistered(format!("proxy id {proxy_id}")))
        }
    }

    /// The remote proxy id to address when calling back into the peer of
    /// (channel, contract, session).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ProxyNotRegistered`] when no proxy matches.
    pub fn peer_proxy_id(
        &self,
        channel_id: &str,
        contract: &str,
        session: &SessionId,
    ) -> Result<u64> {
        self.proxies
            .lock()
            .iter()
            .find(|entry| {
                entry.channel_id == channel_id
                    && entry.contract == contract
                    && entry.session == *session
            })
            .map(|entry| entry.proxy_id)
            .ok_or_else(|| {
                Error::ProxyNotRegistered(format!(
                    "no proxy for contract '{contract}' on channel '{channel_id}' session '{session}'"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe;

    fn probe_instance(dispose_count: Arc<AtomicUsize>) -> ServiceInstance {
        ServiceInstance::new(
            Arc::new(Probe),
            Arc::new(move |_| {
                dispose_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn key(session: &str, proxy_id: u64) -> InstanceKey {
        InstanceKey {
            channel_id: "mem".into(),
            contract: "Echo".into(),
            session: SessionId::new(session),
            implementation: "EchoImpl".into(),
            proxy_id,
        }
    }

    #[test]
    fn resolve_returns_same_instance_for_same_key() {
        let manager = LifetimeManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let activations = Arc::new(AtomicUsize::new(0));

        let activate = || {
            activations.fetch_add(1, Ordering::SeqCst);
            Ok(probe_instance(count.clone()))
        };
        let first = manager
            .resolve_session_instance(key("s1", 1), activate)
            .unwrap();
        let second = manager
            .resolve_session_instance(key("s1", 1), || {
                activations.fetch_add(1, Ordering::SeqCst);
                Ok(probe_instance(count.clone()))
            })
            .unwrap();
        assert!(first.same_object(&second));
        assert_eq!(activations.load(Ordering::SeqCst), 1);

        // Different proxy id on the same session means a distinct instance.
        let third = manager
            .resolve_session_instance(key("s1", 2), || {
                activations.fetch_add(1, Ordering::SeqCst);
                Ok(probe_instance(count.clone()))
            })
            .unwrap();
        assert!(!first.same_object(&third));
        assert_eq!(activations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn session_disconnect_disposes_each_instance_once() {
        let manager = LifetimeManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.register(key("s1", 1), probe_instance(count.clone()));
        manager.register(key("s1", 2), probe_instance(count.clone()));
        manager.register(key("s2", 3), probe_instance(count.clone()));

        manager.session_disconnected("mem", &SessionId::new("s1"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(manager.find(&key("s1", 1)).is_none());
        assert!(manager.find(&key("s1", 2)).is_none());
        assert!(manager.find(&key("s2", 3)).is_some());

        // Disconnecting again finds nothing more to dispose.
        manager.session_disconnected("mem", &SessionId::new("s1"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispose_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let instance = probe_instance(count.clone());
        instance.dispose();
        instance.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn singleton_constructs_once() {
        let manager = LifetimeManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let activations = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let activations = activations.clone();
            let count = count.clone();
            manager
                .singleton("EchoImpl", move || {
                    activations.fetch_add(1, Ordering::SeqCst);
                    Ok(probe_instance(count))
                })
                .unwrap();
        }
        assert_eq!(activations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn proxy_lookup_fails_when_unregistered() {
        let manager = LifetimeManager::new();
        assert!(manager.check_registered(7).is_err());

        manager.register_proxy(7, "mem", "Echo", SessionId::new("s1"));
        assert!(manager.check_registered(7).is_ok());
        assert_eq!(
            manager
                .peer_proxy_id("mem", "Echo", &SessionId::new("s1"))
                .unwrap(),
            7
        );

        assert!(manager.unregister_proxy(7));
        assert!(!manager.unregister_proxy(7));
        assert!(
            manager
                .peer_proxy_id("mem", "Echo", &SessionId::new("s1"))
                .is_err()
        );
    }

    #[test]
    fn unregister_channel_purges_instances_and_proxies() {
        let manager = LifetimeManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.register(key("s1", 1), probe_instance(count.clone()));
        manager.register_proxy(1, "mem", "Echo", SessionId::new("s1"));

        manager.unregister_channel("mem");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.find(&key("s1", 1)).is_none());
        assert!(manager.check_registered(1).is_err());
    }
}
