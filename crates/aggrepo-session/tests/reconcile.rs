//! The background reconciliation thread.

mod common;

use aggrepo_core::ManualClock;
use aggrepo_memory::MemoryStore;
use aggrepo_session::{AggregateState, ContextConfig, MemoryGate, PersistenceContext, Reconciler};
use common::{Blog, blog_blueprint, blog_schema};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(TICK);
    }
    condition()
}

#[test]
fn the_reconciler_sweeps_in_the_background() {
    let blog = Blog::with_config(ContextConfig::default().loaded_age(Duration::from_secs(10)));
    let id = blog.insert_post("Background", "ann");
    let post = blog.posts().find_by_id(id, None).unwrap().unwrap();

    let mut reconciler = Reconciler::with_interval(&blog.context, TICK).unwrap();
    assert!(reconciler.is_running());
    assert!(wait_for(|| reconciler.sweeps() >= 2));
    assert_eq!(post.state(), AggregateState::Loaded);

    blog.clock.advance(Duration::from_secs(11));
    assert!(wait_for(|| post.state() == AggregateState::Unloaded));

    reconciler.stop();
    reconciler.stop();
    assert!(!reconciler.is_running());
}

#[test]
fn the_default_interval_comes_from_the_config() {
    let blog = Blog::with_config(ContextConfig::default().gc_interval(Duration::from_secs(90)));
    let reconciler = Reconciler::spawn(&blog.context).unwrap();
    assert_eq!(reconciler.interval(), Duration::from_secs(90));
    drop(reconciler);
}

#[test]
fn dropping_the_context_ends_the_loop() {
    let schema = blog_schema();
    let context = PersistenceContext::builder()
        .store(Arc::new(MemoryStore::from_schema(&schema)))
        .schema(Arc::new(schema))
        .clock(Arc::new(ManualClock::new()))
        .register(blog_blueprint())
        .build()
        .unwrap();

    let reconciler = Reconciler::with_interval(&context, TICK).unwrap();
    drop(context);
    assert!(wait_for(|| !reconciler.is_running()));
}

#[derive(Debug, Default)]
struct ExplodingGate {
    calls: AtomicUsize,
}

impl MemoryGate for ExplodingGate {
    fn should_sweep(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("gate exploded");
    }
}

#[test]
fn a_panicking_sweep_does_not_stop_the_loop() {
    let schema = blog_schema();
    let gate = Arc::new(ExplodingGate::default());
    let context = PersistenceContext::builder()
        .store(Arc::new(MemoryStore::from_schema(&schema)))
        .schema(Arc::new(schema))
        .clock(Arc::new(ManualClock::new()))
        .memory_gate(gate.clone())
        .register(blog_blueprint())
        .build()
        .unwrap();

    let reconciler = Reconciler::with_interval(&context, TICK).unwrap();
    assert!(wait_for(|| gate.calls.load(Ordering::SeqCst) >= 3));
    assert!(reconciler.is_running());
    assert_eq!(reconciler.sweeps(), 0);
}
