//! The persistence context: everything a set of repositories shares.

use crate::aggregate::Aggregate;
use crate::config::{ContextConfig, GcPolicy};
use crate::memory::{AlwaysSweep, MemoryGate, ResidentMemoryGate};
use crate::registry::{AggregateBlueprint, TypeRegistry};
use crate::repository::{GcReport, Repository};
use crate::snapshot::{AggregateSnapshot, rehydrate};
use aggrepo_core::{Clock, Error, Result, SchemaErrorKind, SchemaProvider, SystemClock};
use aggrepo_query::Store;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Collaborators shared by every repository and aggregate of a context.
pub struct Backend {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) schema: Arc<dyn SchemaProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ContextConfig,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("store", &self.store.name())
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// An explicit, shareable context: one store, one schema, one repository per
/// registered aggregate type.
///
/// Build it once with [`PersistenceContext::builder`] and pass the `Arc`
/// around; there is no global instance.
#[derive(Debug)]
pub struct PersistenceContext {
    backend: Arc<Backend>,
    registry: TypeRegistry,
    repositories: BTreeMap<String, Arc<Repository>>,
    memory_gate: Arc<dyn MemoryGate>,
}

impl PersistenceContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Repository of the aggregate type `name`.
    pub fn repository(&self, name: &str) -> Option<&Arc<Repository>> {
        self.repositories.get(name)
    }

    pub fn repositories(&self) -> impl Iterator<Item = &Arc<Repository>> {
        self.repositories.values()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ContextConfig {
        &self.backend.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.backend.clock
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.backend.store
    }

    pub fn memory_gate(&self) -> &Arc<dyn MemoryGate> {
        &self.memory_gate
    }

    /// The ages sweeps apply.
    pub fn policy(&self) -> GcPolicy {
        self.backend.config.gc_policy()
    }

    /// Sweep every repository once and merge the reports.
    #[tracing::instrument(level = "debug", skip(self), fields(namespace = %self.backend.config.namespace))]
    pub fn gc(&self) -> GcReport {
        let policy = self.policy();
        let mut report = GcReport::default();
        for repository in self.repositories.values() {
            report.merge(&repository.gc(&policy, self.memory_gate.as_ref()));
        }
        tracing::debug!(
            committed = report.committed,
            cancelled = report.cancelled,
            unloaded = report.unloaded,
            evicted = report.evicted,
            sessions_expired = report.sessions_expired,
            commit_failures = report.commit_failures,
            "sweep finished"
        );
        report
    }

    /// Rebuild a snapshot into its repository.
    pub fn rehydrate(&self, snapshot: &AggregateSnapshot) -> Result<Arc<Aggregate>> {
        rehydrate(snapshot, self)
    }
}

/// Builder for [`PersistenceContext`].
#[derive(Default)]
pub struct ContextBuilder {
    store: Option<Arc<dyn Store>>,
    schema: Option<Arc<dyn SchemaProvider>>,
    clock: Option<Arc<dyn Clock>>,
    memory_gate: Option<Arc<dyn MemoryGate>>,
    config: ContextConfig,
    registry: TypeRegistry,
}

impl ContextBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: Arc<dyn SchemaProvider>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Time source for access ages. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the gate derived from `memory_threshold`.
    #[must_use]
    pub fn memory_gate(mut self, gate: Arc<dyn MemoryGate>) -> Self {
        self.memory_gate = Some(gate);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn register(mut self, blueprint: AggregateBlueprint) -> Self {
        self.registry.register(blueprint);
        self
    }

    /// Validate the registry against the schema and build the context.
    ///
    /// A root table without schema or primary key is an error; problems with
    /// child tables are logged and left for load time to skip.
    pub fn build(self) -> Result<Arc<PersistenceContext>> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| Error::config("a persistence context needs a store"))?;
        let schema = self
            .schema
            .ok_or_else(|| Error::config("a persistence context needs a schema provider"))?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let memory_gate: Arc<dyn MemoryGate> = match (self.memory_gate, self.config.memory_threshold) {
            (Some(gate), _) => gate,
            (None, Some(threshold)) => Arc::new(
                ResidentMemoryGate::new(threshold).with_page_size(self.config.memory_page_size),
            ),
            (None, None) => Arc::new(AlwaysSweep),
        };

        for blueprint in self.registry.iter() {
            check_blueprint(blueprint, schema.as_ref())?;
        }

        let backend = Arc::new(Backend {
            store,
            schema,
            clock,
            config: self.config,
        });
        let repositories = self
            .registry
            .iter()
            .map(|blueprint| {
                (
                    blueprint.name().to_string(),
                    Repository::new(Arc::clone(blueprint), Arc::clone(&backend)),
                )
            })
            .collect();

        tracing::debug!(
            namespace = %backend.config.namespace,
            store = backend.store.name(),
            aggregates = self.registry.len(),
            "persistence context ready"
        );
        Ok(Arc::new(PersistenceContext {
            backend,
            registry: self.registry,
            repositories,
            memory_gate,
        }))
    }
}

fn check_blueprint(blueprint: &AggregateBlueprint, schema: &dyn SchemaProvider) -> Result<()> {
    let root = schema.table(blueprint.root_table()).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::TableNotFound,
            format!(
                "aggregate '{}' has no schema for root table '{}'",
                blueprint.name(),
                blueprint.root_table()
            ),
        )
    })?;
    if !root.has_primary_key() {
        return Err(Error::schema(
            SchemaErrorKind::MissingPrimaryKey,
            format!("root table '{}' has no primary key", root.name),
        ));
    }

    for child in blueprint.children() {
        let Some(meta) = schema.table(child) else {
            tracing::warn!(aggregate = blueprint.name(), child = %child, "child table has no schema");
            continue;
        };
        match blueprint.relation_for(child) {
            None => {
                tracing::warn!(aggregate = blueprint.name(), child = %child, "child has no relation");
            }
            Some(relation) if !relation.is_well_formed() => {
                tracing::warn!(aggregate = blueprint.name(), child = %child, "child relation is malformed");
            }
            Some(relation) => {
                let unknown = relation
                    .left
                    .iter()
                    .filter(|c| !root.has_column(c))
                    .chain(relation.right.iter().filter(|c| !meta.has_column(c)))
                    .collect::<Vec<_>>();
                if !unknown.is_empty() {
                    tracing::warn!(
                        aggregate = blueprint.name(),
                        child = %child,
                        columns = ?unknown,
                        "relation names unknown columns"
                    );
                }
            }
        }
    }
    Ok(())
}
