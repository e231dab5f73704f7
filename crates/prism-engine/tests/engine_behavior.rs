// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use prism_engine::{
    BackgroundJob, Engine, JobContext, JobError, JobState, Priority, QueueKind, RecordState, Step,
    TypedPointer,
};
use prism_request::{make_entity_id, Identity, Value};

const WAIT: Duration = Duration::from_secs(5);

fn key_of(label: &str) -> Identity {
    Identity::in_domain("test:", label.as_bytes())
}

/// Counts executions, then finishes with a fixed value.
struct CountingJob {
    counter: Arc<AtomicUsize>,
    value: i64,
}

impl BackgroundJob for CountingJob {
    fn execute(&mut self, _ctx: &JobContext) -> Result<Step, JobError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Step::Finished(Value::Int(self.value)))
    }

    fn describe(&self) -> String {
        "counting job".to_owned()
    }
}

/// Spins at check-ins until `release` is set, then finishes.
struct GatedJob {
    release: Arc<AtomicBool>,
    value: i64,
}

impl BackgroundJob for GatedJob {
    fn execute(&mut self, ctx: &JobContext) -> Result<Step, JobError> {
        loop {
            ctx.check_in()?;
            if self.release.load(Ordering::SeqCst) {
                return Ok(Step::Finished(Value::Int(self.value)));
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn describe(&self) -> String {
        "gated job".to_owned()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn concurrent_dispatch_runs_exactly_one_job() {
    let engine = Engine::with_defaults();
    let key = key_of("concurrent");
    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let counter = Arc::clone(&counter);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let pointer = engine.acquire(key);
            barrier.wait();
            engine.dispatch(
                key,
                QueueKind::Calculation,
                Box::new(CountingJob { counter, value: 7 }),
                Priority::NORMAL,
            );
            let state = pointer.wait_ready(WAIT);
            (state, pointer.data().cloned())
        }));
    }

    for handle in handles {
        let (state, data) = handle.join().unwrap();
        assert_eq!(state, RecordState::Ready);
        assert_eq!(data, Some(Value::Int(7)));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[test]
fn dispatch_while_computing_is_a_noop() {
    let engine = Engine::with_defaults();
    let key = key_of("noop");
    let release = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicUsize::new(0));

    let pointer = engine.acquire(key);
    let first = engine.dispatch(
        key,
        QueueKind::Calculation,
        Box::new(GatedJob {
            release: Arc::clone(&release),
            value: 1,
        }),
        Priority::NORMAL,
    );
    wait_for(|| first.state() == JobState::Running);

    // Second dispatch while computing: no new job, same controller target.
    let second = engine.dispatch(
        key,
        QueueKind::Calculation,
        Box::new(CountingJob {
            counter: Arc::clone(&counter),
            value: 99,
        }),
        Priority::NORMAL,
    );
    assert_eq!(second.state(), JobState::Running);

    release.store(true, Ordering::SeqCst);
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(1)));
    assert_eq!(counter.load(Ordering::SeqCst), 0, "the second job must never run");
    engine.shutdown();
}

#[test]
fn cancel_reset_then_redispatch_runs_a_fresh_job() {
    let engine = Engine::with_defaults();
    let key = key_of("cancel-reset");
    let pointer = engine.acquire(key);

    let controller = engine.dispatch(
        key,
        QueueKind::Calculation,
        Box::new(GatedJob {
            release: Arc::new(AtomicBool::new(false)),
            value: 0,
        }),
        Priority::NORMAL,
    );
    wait_for(|| controller.state() == JobState::Running);

    controller.cancel();
    wait_for(|| controller.state() == JobState::Canceled);
    wait_for(|| pointer.state() == RecordState::Canceled);

    // Cancellation is not a failure; reset returns the record to Nowhere.
    assert!(pointer.failure().is_none());
    engine.reset_record(key);
    assert_eq!(pointer.state(), RecordState::Nowhere);

    let counter = Arc::new(AtomicUsize::new(0));
    engine.dispatch(
        key,
        QueueKind::Calculation,
        Box::new(CountingJob {
            counter: Arc::clone(&counter),
            value: 42,
        }),
        Priority::NORMAL,
    );
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Ready);
    assert_eq!(pointer.data(), Some(&Value::Int(42)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[test]
fn failures_are_stored_and_surfaced_to_every_observer() {
    struct FailingJob;
    impl BackgroundJob for FailingJob {
        fn execute(&mut self, _ctx: &JobContext) -> Result<Step, JobError> {
            Err(JobError::execution("mesh generation failed"))
        }
        fn describe(&self) -> String {
            "failing job".to_owned()
        }
    }

    let engine = Engine::with_defaults();
    let key = key_of("failure");
    let pointer = engine.acquire(key);
    engine.dispatch(
        key,
        QueueKind::Calculation,
        Box::new(FailingJob),
        Priority::NORMAL,
    );
    assert_eq!(pointer.wait_ready(WAIT), RecordState::Failed);
    let failure = pointer.failure().unwrap();
    assert!(failure.message.contains("mesh generation failed"));

    // A later observer attaches to the same failed record; nothing retries.
    let second = engine.acquire(key);
    assert_eq!(second.state(), RecordState::Failed);
    assert!(second.failure().is_some());
    engine.shutdown();
}

#[test]
fn set_result_seeds_a_record_and_pointers_cache_locally() {
    let engine = Engine::with_defaults();
    let key = key_of("seed");
    let pointer = engine.acquire(key);
    assert_eq!(pointer.state(), RecordState::Nowhere);

    engine.set_result(key, Value::Text("cached".into()));
    assert_eq!(pointer.state(), RecordState::Ready);
    assert!((pointer.progress() - 1.0).abs() < f64::EPSILON);
    assert_eq!(pointer.data(), Some(&Value::Text("cached".into())));

    let typed: TypedPointer<String> = TypedPointer::new(pointer.clone());
    assert_eq!(typed.data(), Some("cached".to_owned()));
    engine.shutdown();
}

#[test]
fn records_are_evicted_when_the_last_pointer_releases() {
    let engine = Engine::with_defaults();
    let key = key_of("evict");
    let first = engine.acquire(key);
    let second = first.clone();
    engine.set_result(key, Value::Int(1));
    assert_eq!(engine.record_count(), 1);

    drop(first);
    assert_eq!(engine.record_count(), 1, "a live pointer keeps the record");
    drop(second);
    assert_eq!(engine.record_count(), 0);
    engine.shutdown();
}

#[test]
fn watch_registrations_are_reference_counted() {
    let engine = Engine::with_defaults();
    let entity = make_entity_id("watched-entity");
    let watch_key = key_of("watch-job");
    let factories = Arc::new(AtomicUsize::new(0));

    let pointer = engine.acquire(watch_key);
    let make_watch = |engine: &Engine| {
        let engine_for_factory = engine.clone();
        let factories = Arc::clone(&factories);
        engine.watch_entity(entity, move || {
            factories.fetch_add(1, Ordering::SeqCst);
            engine_for_factory.dispatch(
                watch_key,
                QueueKind::NotificationWatch,
                Box::new(GatedJob {
                    release: Arc::new(AtomicBool::new(false)),
                    value: 0,
                }),
                Priority::NORMAL,
            )
        })
    };

    let first = make_watch(&engine);
    let second = make_watch(&engine);
    assert_eq!(engine.watch_count(entity), 2);
    assert_eq!(factories.load(Ordering::SeqCst), 1, "factory runs once");

    drop(first);
    assert_eq!(engine.watch_count(entity), 1);

    // Dropping the last handle cancels the long-lived watch job.
    drop(second);
    assert_eq!(engine.watch_count(entity), 0);
    wait_for(|| pointer.state() == RecordState::Canceled);
    engine.shutdown();
}
