//! Fixtures shared by the facade integration tests.
#![allow(dead_code)]

use aggrepo::{
    AggregateBlueprint, AggregateSnapshot, AggregateState, ContextConfig, ManualClock,
    MemoryStore, PersistenceContext, Repository, SchemaMap, TableMeta, Value,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

pub fn schema() -> SchemaMap {
    SchemaMap::new()
        .with_table(
            TableMeta::new("post")
                .auto_key("id")
                .attribute("title")
                .attribute("author")
                .staleness_column("modified"),
        )
        .with_table(
            TableMeta::new("comment")
                .auto_key("id")
                .attribute("post_id")
                .attribute("body"),
        )
}

pub fn blueprint() -> AggregateBlueprint {
    AggregateBlueprint::new("blog", "post").relation("comment", ["id"], ["post_id"])
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub context: Arc<PersistenceContext>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(ContextConfig::default(), blueprint())
    }

    pub fn build(config: ContextConfig, blueprint: AggregateBlueprint) -> Self {
        let schema = schema();
        let store = Arc::new(MemoryStore::from_schema(&schema));
        let clock = Arc::new(ManualClock::new());
        let context = PersistenceContext::builder()
            .store(store.clone())
            .schema(Arc::new(schema))
            .clock(clock.clone())
            .config(config)
            .register(blueprint)
            .build()
            .unwrap();
        Self {
            store,
            clock,
            context,
        }
    }

    pub fn posts(&self) -> &Arc<Repository> {
        self.context.repository("blog").unwrap()
    }

    pub fn post(&self, title: &str) -> i64 {
        self.store
            .insert_row(
                "post",
                [("title", Value::from(title)), ("author", Value::from("ann"))],
            )
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap()
    }

    pub fn comment(&self, post_id: i64, body: &str) {
        self.store
            .insert_row(
                "comment",
                [("post_id", Value::from(post_id)), ("body", Value::from(body))],
            )
            .unwrap();
    }
}

/// The state an aggregate's contents imply.
pub fn implied_state(snapshot: &AggregateSnapshot) -> AggregateState {
    let records = || snapshot.root.iter().chain(snapshot.children.values().flatten());
    if records().any(|r| !r.pending.is_empty()) {
        return AggregateState::Dirty;
    }
    match &snapshot.root {
        None => AggregateState::New,
        Some(root) if root.initialized => AggregateState::Loaded,
        Some(_) if snapshot.children.values().any(|c| !c.is_empty()) => AggregateState::Loaded,
        Some(_) => AggregateState::Unloaded,
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

/// A layer that records every event emitted while [`LogCapture::run`] is active.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_message(&self, level: Level, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level && e.message == message)
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}
