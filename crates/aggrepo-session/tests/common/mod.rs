//! Shared fixtures: a blog schema (posts owning comments) over a `MemoryStore`.
#![allow(dead_code)]

use aggrepo_core::{Clock, ManualClock, SchemaMap, TableMeta, Value};
use aggrepo_memory::MemoryStore;
use aggrepo_session::{AggregateBlueprint, ContextConfig, PersistenceContext, Repository};
use std::sync::Arc;
use std::time::Instant;

pub fn blog_schema() -> SchemaMap {
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

pub fn blog_blueprint() -> AggregateBlueprint {
    AggregateBlueprint::new("blog", "post").relation("comment", ["id"], ["post_id"])
}

pub struct Blog {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub context: Arc<PersistenceContext>,
}

impl Blog {
    pub fn new() -> Self {
        Self::with(ContextConfig::default(), blog_blueprint())
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self::with(config, blog_blueprint())
    }

    pub fn with(config: ContextConfig, blueprint: AggregateBlueprint) -> Self {
        let schema = blog_schema();
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

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn insert_post(&self, title: &str, author: &str) -> i64 {
        self.store
            .insert_row(
                "post",
                [("title", Value::from(title)), ("author", Value::from(author))],
            )
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap()
    }

    pub fn insert_comment(&self, post_id: i64, body: &str) -> i64 {
        self.store
            .insert_row(
                "comment",
                [("post_id", Value::from(post_id)), ("body", Value::from(body))],
            )
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap()
    }
}
