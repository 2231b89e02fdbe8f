//! End-to-end tests: proxy -> memory channel -> dispatcher -> service.

use remoting_core::{
    Channel, ContractDescription, ContractRegistry, Error, FaultKind, InvokeMode, LifetimeMode,
    LifetimeManager, MethodParameter, OperationDescriptor, ProxyFactory, ServiceFactory,
    ServiceImplementation, formatter,
    memory::{MemoryEndpoint, memory_pair},
    send_response_manually,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Counters {
    constructed: AtomicUsize,
    disposed: AtomicUsize,
    notified: AtomicUsize,
    pinged: AtomicUsize,
    double_reply_rejected: AtomicUsize,
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

struct EchoService {
    instance_id: u64,
    counters: Arc<Counters>,
}

impl EchoService {
    fn new(counters: Arc<Counters>) -> Self {
        counters.constructed.fetch_add(1, Ordering::SeqCst);
        Self {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst),
            counters,
        }
    }
}

fn echo_contract(lifetime: LifetimeMode) -> ContractDescription {
    ContractDescription::new("Echo", lifetime)
        .operation("Say", ["String"], OperationDescriptor::default())
        .operation("Who", Vec::<String>::new(), OperationDescriptor::default())
        .operation("Fail", ["String"], OperationDescriptor::default())
        .operation(
            "Sleep",
            ["Int"],
            OperationDescriptor::default().with_call_timeout(Some(Duration::from_millis(200))),
        )
        .operation("Defer", ["String"], OperationDescriptor::default())
        .operation("Notify", ["String"], OperationDescriptor::one_way())
        .operation(
            "Ping",
            Vec::<String>::new(),
            OperationDescriptor {
                reliable: false,
                ..OperationDescriptor::default()
            },
        )
}

fn echo_methods(
    builder: remoting_core::contract::ServiceImplementationBuilder<EchoService>,
) -> remoting_core::contract::ServiceImplementationBuilder<EchoService> {
    builder
        .dispose(|svc: &EchoService| {
            svc.counters.disposed.fetch_add(1, Ordering::SeqCst);
        })
        .method("Say", ["String"], "String", |_svc, params| async move {
            let text: String = formatter::decode(&params[0].value)?;
            formatter::encode(&text)
        })
        .method("Who", Vec::<String>::new(), "Int", |svc, _params| {
            let id = svc.instance_id;
            async move { formatter::encode(&id) }
        })
        .method("Fail", ["String"], "String", |_svc, params| async move {
            let text: String = formatter::decode(&params[0].value)?;
            Err(remoting_core::InvocationFault::method_failed(text).into())
        })
        .method("Sleep", ["Int"], "Nil", |_svc, params| async move {
            let millis: u64 = formatter::decode(&params[0].value)?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            formatter::encode(&())
        })
        .method("Defer", ["String"], "String", |svc, params| async move {
            let text: String = formatter::decode(&params[0].value)?;
            let reply = formatter::encode(&format!("deferred:{text}"))?;
            send_response_manually(reply, None).await?;
            // A second manual reply for the same request must be refused.
            let second = send_response_manually(bytes::Bytes::new(), None).await;
            if matches!(second, Err(Error::InvalidOperation(_))) {
                svc.counters.double_reply_rejected.fetch_add(1, Ordering::SeqCst);
            }
            Ok(bytes::Bytes::new())
        })
        .method("Notify", ["String"], "Nil", |svc, _params| async move {
            svc.counters.notified.fetch_add(1, Ordering::SeqCst);
            formatter::encode(&())
        })
        .method("Ping", Vec::<String>::new(), "Nil", |svc, _params| {
            async move {
                svc.counters.pinged.fetch_add(1, Ordering::SeqCst);
                formatter::encode(&())
            }
        })
}

struct Stack {
    client_end: Arc<MemoryEndpoint>,
    registry: Arc<ContractRegistry>,
    lifetimes: Arc<LifetimeManager>,
    service: ServiceFactory,
    counters: Arc<Counters>,
}

fn build_stack(lifetime: LifetimeMode, session_reusable: bool) -> Stack {
    let (client_end, server_end) = memory_pair("mem", session_reusable);
    let registry = Arc::new(ContractRegistry::new());
    let lifetimes = Arc::new(LifetimeManager::new());
    let counters = Arc::new(Counters::default());

    let builder = ServiceImplementation::builder::<EchoService>("EchoService");
    let builder = match lifetime {
        LifetimeMode::PerSession => {
            let counters = Arc::clone(&counters);
            builder.activate_per_session(move |_channel, _session| {
                Ok(EchoService::new(Arc::clone(&counters)))
            })
        }
        _ => {
            let counters = Arc::clone(&counters);
            builder.activate(move || Ok(EchoService::new(Arc::clone(&counters))))
        }
    };
    let implementation = echo_methods(builder).build().unwrap();

    let service = ServiceFactory::new(
        echo_contract(lifetime),
        implementation,
        server_end,
        Arc::clone(&registry),
        Arc::clone(&lifetimes),
    );
    service.open().unwrap();
    registry
        .register_client_contract(echo_contract(lifetime), Some("mem".into()))
        .unwrap();

    Stack {
        client_end,
        registry,
        lifetimes,
        service,
        counters,
    }
}

fn proxy_factory(stack: &Stack) -> Arc<ProxyFactory> {
    Arc::new(ProxyFactory::new(
        "Echo",
        "local",
        Arc::clone(&stack.client_end) as Arc<dyn remoting_core::Channel>,
        Arc::clone(&stack.registry),
        Arc::clone(&stack.lifetimes),
    ))
}

fn string_param(value: &str) -> Vec<MethodParameter> {
    vec![MethodParameter::new(
        0,
        "String",
        formatter::encode(&value.to_string()).unwrap(),
    )]
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn echo_round_trip_returns_the_argument() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let reply = proxy.invoke("Say", string_param("hi")).await.unwrap();
    let text: String = formatter::decode(&reply).unwrap();
    assert_eq!(text, "hi");
}

#[tokio::test]
async fn concurrent_calls_complete_independently() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let factory = proxy_factory(&stack);
    let proxy = factory.create_proxy().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move {
            let word = format!("word-{i}");
            let reply = proxy.invoke("Say", string_param(&word)).await.unwrap();
            let text: String = formatter::decode(&reply).unwrap();
            assert_eq!(text, word);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // No SingleCall instance outlives its invocation.
    wait_until(|| {
        stack.counters.disposed.load(Ordering::SeqCst)
            == stack.counters.constructed.load(Ordering::SeqCst)
    })
    .await;
    assert_eq!(stack.counters.constructed.load(Ordering::SeqCst), 8);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_at_the_operation_timeout() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = proxy
        .invoke(
            "Sleep",
            vec![MethodParameter::new(
                0,
                "Int",
                formatter::encode(&60_000u64).unwrap(),
            )],
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(60_000));
}

#[tokio::test]
async fn fault_surfaces_as_remote_invocation_and_keeps_channel_alive() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let err = proxy.invoke("Fail", string_param("boom")).await.unwrap_err();
    match err {
        Error::RemoteInvocation(fault) => {
            assert_eq!(fault.kind, FaultKind::MethodFailed);
            assert!(fault.message.contains("boom"));
        }
        other => panic!("expected remote invocation error, got {other}"),
    }

    // The channel stays usable after a fault.
    let reply = proxy.invoke("Say", string_param("still-alive")).await.unwrap();
    let text: String = formatter::decode(&reply).unwrap();
    assert_eq!(text, "still-alive");
}

#[tokio::test]
async fn unregistered_contract_faults_the_call() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();
    let _ = stack.registry.unregister_service_contract("Echo");

    let err = proxy.invoke("Say", string_param("hi")).await.unwrap_err();
    match err {
        Error::RemoteInvocation(fault) => {
            assert_eq!(fault.kind, FaultKind::ContractNotRegistered);
        }
        other => panic!("expected fault, got {other}"),
    }
}

#[tokio::test]
async fn unknown_method_comes_back_as_method_not_found() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let err = proxy.invoke("Shout", string_param("hi")).await.unwrap_err();
    match err {
        Error::RemoteInvocation(fault) => assert_eq!(fault.kind, FaultKind::MethodNotFound),
        other => panic!("expected fault, got {other}"),
    }
}

#[tokio::test]
async fn mismatched_signature_names_the_offending_parameter() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let err = proxy
        .invoke(
            "Say",
            vec![MethodParameter::new(
                0,
                "Int",
                formatter::encode(&1u64).unwrap(),
            )],
        )
        .await
        .unwrap_err();
    match err {
        Error::RemoteInvocation(fault) => {
            assert_eq!(fault.kind, FaultKind::ParameterUnresolved);
            assert_eq!(fault.parameter.as_deref(), Some("parameter 0"));
        }
        other => panic!("expected fault, got {other}"),
    }
}

#[tokio::test]
async fn per_session_instances_are_stable_per_proxy() {
    let stack = build_stack(LifetimeMode::PerSession, true);
    let factory = proxy_factory(&stack);
    let first = factory.create_proxy().await.unwrap();
    let second = factory.create_proxy().await.unwrap();

    let id_a: u64 = formatter::decode(&first.invoke("Who", vec![]).await.unwrap()).unwrap();
    let id_b: u64 = formatter::decode(&first.invoke("Who", vec![]).await.unwrap()).unwrap();
    let id_c: u64 = formatter::decode(&second.invoke("Who", vec![]).await.unwrap()).unwrap();

    assert_eq!(id_a, id_b);
    assert_ne!(id_a, id_c);
    assert_eq!(stack.counters.constructed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn session_disconnect_disposes_per_session_instances() {
    let stack = build_stack(LifetimeMode::PerSession, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();
    proxy.invoke("Say", string_param("hello")).await.unwrap();
    assert_eq!(stack.counters.constructed.load(Ordering::SeqCst), 1);

    stack.client_end.disconnect(proxy.session()).await.unwrap();
    wait_until(|| stack.counters.disposed.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn singleton_is_constructed_once_under_concurrency() {
    let stack = build_stack(LifetimeMode::Singleton, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move {
            formatter::decode::<u64>(&proxy.invoke("Who", vec![]).await.unwrap()).unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(stack.counters.constructed.load(Ordering::SeqCst), 1);
    assert_eq!(stack.counters.disposed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn manual_reply_reaches_the_caller_and_double_reply_is_refused() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let reply = proxy.invoke("Defer", string_param("later")).await.unwrap();
    let text: String = formatter::decode(&reply).unwrap();
    assert_eq!(text, "deferred:later");

    wait_until(|| stack.counters.double_reply_rejected.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn one_way_call_returns_immediately_without_response() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let reply = proxy.invoke("Notify", string_param("fire")).await.unwrap();
    assert!(reply.is_empty());
    wait_until(|| stack.counters.notified.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn datagram_call_is_acknowledged_but_returns_nothing() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let reply = proxy.invoke("Ping", vec![]).await.unwrap();
    assert!(reply.is_empty());
    wait_until(|| stack.counters.pinged.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn disposed_proxy_rejects_calls_and_double_dispose_is_noop() {
    let stack = build_stack(LifetimeMode::PerSession, false);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    proxy.dispose().await.unwrap();
    proxy.dispose().await.unwrap();

    let err = proxy.invoke("Say", string_param("hi")).await.unwrap_err();
    assert!(matches!(err, Error::ObjectDisposed(_)));
}

#[tokio::test]
async fn dispose_of_owned_session_disconnects_it() {
    // One session per proxy: dispose tears the session down and the
    // server side drops the per-session instance.
    let stack = build_stack(LifetimeMode::PerSession, false);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();
    proxy.invoke("Say", string_param("hello")).await.unwrap();

    proxy.dispose().await.unwrap();
    wait_until(|| stack.counters.disposed.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn begin_end_create_completes_and_rejects_foreign_handles() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let factory = proxy_factory(&stack);

    let pending = factory.begin_create();
    let proxy = factory.end_create(pending).await.unwrap();
    let reply = proxy.invoke("Say", string_param("async")).await.unwrap();
    let text: String = formatter::decode(&reply).unwrap();
    assert_eq!(text, "async");

    let other = proxy_factory(&stack);
    let pending = factory.begin_create();
    let err = other.end_create(pending).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
}

#[tokio::test]
async fn second_service_for_same_contract_fails_to_open() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let (_, server_end) = memory_pair("mem2", true);
    let implementation = echo_methods(
        ServiceImplementation::builder::<EchoService>("EchoService").activate({
            let counters = Arc::clone(&stack.counters);
            move || Ok(EchoService::new(Arc::clone(&counters)))
        }),
    )
    .build()
    .unwrap();

    let second = ServiceFactory::new(
        echo_contract(LifetimeMode::SingleCall),
        implementation,
        server_end,
        Arc::clone(&stack.registry),
        Arc::clone(&stack.lifetimes),
    );
    let err = second.open().unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
}

#[tokio::test]
async fn callback_requests_are_ignored_by_the_service_dispatcher() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let factory = Arc::new(
        ProxyFactory::new(
            "Echo",
            "local",
            Arc::clone(&stack.client_end) as Arc<dyn remoting_core::Channel>,
            Arc::clone(&stack.registry),
            Arc::clone(&stack.lifetimes),
        )
        .with_invoke_mode(InvokeMode::RequestCallback),
    );
    let proxy = factory.create_proxy().await.unwrap();

    // The service dispatcher only processes RequestService, so a
    // callback-mode request gets no reply and times out client-side.
    let started = std::time::Instant::now();
    let err = proxy
        .invoke(
            "Sleep",
            vec![MethodParameter::new(
                0,
                "Int",
                formatter::encode(&0u64).unwrap(),
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn service_close_stops_dispatch_and_unregisters() {
    let stack = build_stack(LifetimeMode::SingleCall, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();
    proxy.invoke("Say", string_param("hi")).await.unwrap();

    stack.service.close().await.unwrap();
    assert!(stack.registry.service_descriptor("Echo").is_none());

    // Re-opening succeeds now that the contract was unregistered.
    stack.service.open().unwrap();
    let reply = proxy.invoke("Say", string_param("again")).await.unwrap();
    let text: String = formatter::decode(&reply).unwrap();
    assert_eq!(text, "again");
}

#[tokio::test]
async fn peer_proxy_id_is_visible_to_the_service_side() {
    let stack = build_stack(LifetimeMode::PerSession, true);
    let proxy = proxy_factory(&stack).create_proxy().await.unwrap();

    let peer = stack
        .lifetimes
        .peer_proxy_id("mem", "Echo", proxy.session())
        .unwrap();
    assert_eq!(peer, proxy.proxy_id());

    proxy.dispose().await.unwrap();
    assert!(
        stack
            .lifetimes
            .peer_proxy_id("mem", "Echo", proxy.session())
            .is_err()
    );
}
