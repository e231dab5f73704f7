// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use prism_engine::{Engine, RecordState, Resolver};
use prism_provider::{run_provider, ProviderConfig};
use prism_registry::{CalcError, CallContext, Registry, CODE_UNKNOWN_FUNCTION};
use prism_request::{Request, Value};
use prism_supervisor::{CalcSupervisor, SupervisorConfig};

const WAIT: Duration = Duration::from_secs(10);

fn provider_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("double", |_ctx: &CallContext, args: &[Value]| match args {
        [Value::Int(n)] => Ok(Value::Int(n * 2)),
        _ => Err(CalcError::bad_arguments("double expects one int")),
    });
    registry.register("slow_double", |ctx: &CallContext, args: &[Value]| {
        let [Value::Int(n)] = args else {
            return Err(CalcError::bad_arguments("slow_double expects one int"));
        };
        ctx.report_progress(0.25);
        std::thread::sleep(Duration::from_millis(300));
        Ok(Value::Int(n * 2))
    });
    registry
}

/// Starts a provider process stand-in on its own runtime thread.
fn spawn_provider(addr: String) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("provider runtime");
        let _ = runtime.block_on(run_provider(
            &addr,
            ProviderConfig::default(),
            Arc::new(provider_registry()),
        ));
    })
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

struct Harness {
    engine: Engine,
    resolver: Resolver,
    supervisor: Arc<CalcSupervisor>,
    provider: std::thread::JoinHandle<()>,
}

fn start(config: SupervisorConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let supervisor = Arc::new(CalcSupervisor::bind(config).expect("bind supervisor"));
    let provider = spawn_provider(supervisor.local_addr().to_string());
    {
        let supervisor = Arc::clone(&supervisor);
        wait_for(move || supervisor.provider_count() >= 1);
    }

    let engine = Engine::with_defaults();
    let resolver = Resolver::new(engine.clone(), Arc::new(Registry::new()))
        .with_remote(Arc::clone(&supervisor) as Arc<dyn prism_engine::RemoteBackend>);
    Harness {
        engine,
        resolver,
        supervisor,
        provider,
    }
}

fn finish(harness: Harness) {
    let Harness {
        engine,
        resolver,
        supervisor,
        provider,
    } = harness;
    drop(resolver);
    engine.shutdown();
    drop(supervisor);
    let _ = provider.join();
}

#[test]
fn remote_double_resolves_out_of_process() {
    let harness = start(SupervisorConfig::default());

    let request = Request::remote(Request::call(
        "pkg",
        "app",
        "double",
        vec![Request::immediate(Value::Int(21))],
        1,
    ));
    let pointer = harness.resolver.resolve(&request);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));

    drop(pointer);
    finish(harness);
}

#[test]
fn liveness_pings_flow_while_a_remote_calculation_runs() {
    // Ping much faster than the calculation so several liveness rounds
    // overlap the in-flight function; the call still completes, which means
    // pongs were answered without waiting on it.
    let harness = start(SupervisorConfig {
        ping_interval: Duration::from_millis(50),
        ..SupervisorConfig::default()
    });

    let request = Request::remote(Request::call(
        "pkg",
        "app",
        "slow_double",
        vec![Request::immediate(Value::Int(21))],
        1,
    ));
    let pointer = harness.resolver.resolve(&request);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));

    drop(pointer);
    finish(harness);
}

#[test]
fn remote_progress_reaches_the_pointer() {
    let harness = start(SupervisorConfig::default());

    let request = Request::remote(Request::call(
        "pkg",
        "app",
        "slow_double",
        vec![Request::immediate(Value::Int(4))],
        1,
    ));
    let pointer = harness.resolver.resolve(&request);

    // The provider reports 0.25 immediately; it must surface before the
    // result lands (or the result itself pins progress at 1.0).
    wait_for(|| pointer.progress() > 0.0 || pointer.state() == RecordState::Ready);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(8)));
    assert!((pointer.progress() - 1.0).abs() < f64::EPSILON);

    drop(pointer);
    finish(harness);
}

#[test]
fn remote_failures_carry_the_provider_code() {
    let harness = start(SupervisorConfig::default());

    let request = Request::remote(Request::call(
        "pkg",
        "app",
        "not_registered",
        vec![],
        1,
    ));
    let pointer = harness.resolver.resolve(&request);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Failed);
    let failure = pointer.failure().expect("failure payload");
    assert_eq!(failure.code, CODE_UNKNOWN_FUNCTION);
    assert!(failure.message.contains("not_registered"));

    drop(pointer);
    finish(harness);
}

#[test]
fn sequential_remote_calls_reuse_the_connection() {
    let harness = start(SupervisorConfig::default());

    for n in [1i64, 2, 3] {
        let request = Request::remote(Request::call(
            "pkg",
            "app",
            "double",
            vec![Request::immediate(Value::Int(n))],
            1,
        ));
        let pointer = harness.resolver.resolve(&request);
        assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
        assert_eq!(pointer.data(), Some(&Value::Int(n * 2)));
    }
    assert_eq!(harness.supervisor.provider_count(), 1);

    finish(harness);
}
