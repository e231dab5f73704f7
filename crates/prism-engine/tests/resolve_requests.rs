// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prism_engine::{Engine, RecordState, RefreshFlags, Resolver};
use prism_registry::{CalcError, CallContext, Registry, CODE_UNKNOWN_FUNCTION};
use prism_request::{make_entity_id, Identity, Request, Value};

const WAIT: Duration = Duration::from_secs(5);

fn base_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("double", |_ctx: &CallContext, args: &[Value]| match args {
        [Value::Int(n)] => Ok(Value::Int(n * 2)),
        _ => Err(CalcError::bad_arguments("double expects one int")),
    });
    registry.register("add", |_ctx: &CallContext, args: &[Value]| {
        let mut sum = 0;
        for arg in args {
            match arg {
                Value::Int(n) => sum += n,
                _ => return Err(CalcError::bad_arguments("add expects ints")),
            }
        }
        Ok(Value::Int(sum))
    });
    registry
}

fn resolver_with(registry: Registry) -> (Engine, Resolver) {
    let engine = Engine::with_defaults();
    let resolver = Resolver::new(engine.clone(), Arc::new(registry));
    (engine, resolver)
}

fn double_of(n: i64) -> Request {
    Request::call("pkg", "app", "double", vec![Request::immediate(Value::Int(n))], 0)
}

#[test]
fn immediate_requests_resolve_without_a_job() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&Request::immediate(Value::Int(5)));
    assert_eq!(pointer.state(), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(5)));
    engine.shutdown();
}

#[test]
fn function_calls_resolve_through_the_registry() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&double_of(21));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));
    engine.shutdown();
}

#[test]
fn composite_requests_combine_child_values() {
    let (engine, resolver) = resolver_with(base_registry());
    let request = Request::structure([
        ("lhs".to_owned(), Request::immediate(Value::Int(1))),
        (
            "rhs".to_owned(),
            Request::array(vec![Request::immediate(Value::Int(2)), double_of(3)]),
        ),
    ]);
    let pointer = resolver.resolve(&request);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(
        pointer.data(),
        Some(&Value::Map(BTreeMap::from([
            ("lhs".to_owned(), Value::Int(1)),
            (
                "rhs".to_owned(),
                Value::List(vec![Value::Int(2), Value::Int(6)])
            ),
        ])))
    );
    engine.shutdown();
}

#[test]
fn property_access_extracts_a_field() {
    let (engine, resolver) = resolver_with(base_registry());
    let base = Request::structure([("answer".to_owned(), double_of(21))]);
    let pointer = resolver.resolve(&Request::property(base.clone(), "answer"));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));

    let missing = resolver.resolve(&Request::property(base, "nope"));
    assert_eq!(missing.wait_ready(WAIT), RecordState::Failed);
    assert!(missing.failure().unwrap().message.contains("nope"));
    engine.shutdown();
}

#[test]
fn union_wraps_the_member_value() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&Request::union("meters", Request::immediate(Value::Int(3))));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(
        pointer.data(),
        Some(&Value::Map(BTreeMap::from([(
            "meters".to_owned(),
            Value::Int(3)
        )])))
    );
    engine.shutdown();
}

#[test]
fn required_rejects_null_and_optional_passes_it() {
    let (engine, resolver) = resolver_with(base_registry());
    let null = Request::immediate(Value::Null);

    let optional = resolver.resolve(&Request::optional(null.clone()));
    assert_eq!(optional.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(optional.data(), Some(&Value::Null));

    let required = resolver.resolve(&Request::required(null));
    assert_eq!(required.wait_ready(WAIT), RecordState::Failed);
    assert!(required.failure().unwrap().message.contains("absent"));
    engine.shutdown();
}

#[test]
fn identical_subtrees_compute_once_across_trees() {
    let mut registry = base_registry();
    let counter = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&counter);
    registry.register("counted", move |_ctx: &CallContext, args: &[Value]| {
        calls.fetch_add(1, Ordering::SeqCst);
        match args {
            [Value::Int(n)] => Ok(Value::Int(n * 10)),
            _ => Err(CalcError::bad_arguments("counted expects one int")),
        }
    });
    let (engine, resolver) = resolver_with(registry);

    let shared = Request::call(
        "pkg",
        "app",
        "counted",
        vec![Request::immediate(Value::Int(5))],
        0,
    );
    // Hold interest in the shared subtree so its record survives between
    // the two resolutions.
    let shared_pointer = engine.acquire(shared.identity());
    let first = resolver.resolve(&Request::array(vec![shared.clone()]));
    let second = resolver.resolve(&Request::structure([(
        "x".to_owned(),
        // Built independently, structurally equal: same record key.
        Request::call(
            "pkg",
            "app",
            "counted",
            vec![Request::immediate(Value::Int(5))],
            0,
        ),
    )]));

    assert_eq!(first.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(second.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    drop(shared_pointer);
    engine.shutdown();
}

#[test]
fn registry_misses_fail_with_the_unknown_function_code() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&Request::array(vec![Request::call(
        "pkg",
        "app",
        "no_such_fn",
        vec![],
        0,
    )]));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Failed);
    assert_eq!(pointer.failure().unwrap().code, CODE_UNKNOWN_FUNCTION);
    engine.shutdown();
}

#[test]
fn meta_requests_resolve_the_generated_request() {
    let mut registry = base_registry();
    registry.register("make_doubler", |_ctx: &CallContext, args: &[Value]| {
        let [Value::Int(n)] = args else {
            return Err(CalcError::bad_arguments("make_doubler expects one int"));
        };
        let generated = Request::call(
            "pkg",
            "app",
            "double",
            vec![Request::immediate(Value::Int(*n))],
            0,
        );
        let bytes = generated
            .encode_cbor()
            .map_err(|err| CalcError::new(prism_registry::CODE_EXECUTION, err.to_string()))?;
        Ok(Value::Bytes(bytes.into()))
    });
    let (engine, resolver) = resolver_with(registry);

    let generator = Request::call(
        "pkg",
        "app",
        "make_doubler",
        vec![Request::immediate(Value::Int(21))],
        0,
    );
    let pointer = resolver.resolve(&Request::meta(generator));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));
    engine.shutdown();
}

#[test]
fn object_refs_read_the_mutable_cache() {
    let (engine, resolver) = resolver_with(base_registry());
    let entity = make_entity_id("camera-target");
    engine.mutable().set_latest(entity, Value::Int(9));

    let pointer = resolver.resolve(&Request::object_ref(entity));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(9)));

    // A stale value is still served; refresh only invalidates.
    engine.mutable().refresh(entity, RefreshFlags::default());
    assert_eq!(engine.mutable().get_latest(entity, None), Some(Value::Int(9)));
    engine.shutdown();
}

#[test]
fn missing_object_refs_fail() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&Request::object_ref(make_entity_id("never-set")));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Failed);
    engine.shutdown();
}

#[test]
fn immutable_refs_attach_to_seeded_records() {
    let (engine, resolver) = resolver_with(base_registry());
    let seed_key = Identity::in_domain("test:", b"immutable-seed");
    let seed = engine.acquire(seed_key);
    engine.set_result(seed_key, Value::Text("baked".into()));

    let pointer = resolver.resolve(&Request::immutable_ref(seed_key));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Text("baked".into())));
    drop(seed);
    engine.shutdown();
}

#[test]
fn unresolved_immutable_refs_fail() {
    let (engine, resolver) = resolver_with(base_registry());
    let pointer = resolver.resolve(&Request::immutable_ref(Identity::in_domain(
        "test:",
        b"never-seeded",
    )));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Failed);
    assert!(pointer
        .failure()
        .unwrap()
        .message
        .contains("unresolved immutable reference"));
    engine.shutdown();
}

#[test]
fn compacted_requests_resolve_via_expansion() {
    let (engine, resolver) = resolver_with(base_registry());
    let bound = Request::let_binding(
        "v0",
        double_of(2),
        Request::array(vec![Request::variable("v0"), Request::variable("v0")]),
    );
    let pointer = resolver.resolve(&bound);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(
        pointer.data(),
        Some(&Value::List(vec![Value::Int(4), Value::Int(4)]))
    );
    engine.shutdown();
}

#[test]
fn isolated_subtrees_share_their_own_record() {
    let (engine, resolver) = resolver_with(base_registry());
    // Express interest in the inner subtree under its own key first.
    let child = engine.acquire(double_of(8).identity());
    assert_eq!(child.state(), RecordState::Nowhere);

    let pointer = resolver.resolve(&Request::isolated(double_of(8)));
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(16)));

    // The subtree resolved under its own key, independently observable.
    assert_eq!(child.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(child.data(), Some(&Value::Int(16)));
    engine.shutdown();
}
