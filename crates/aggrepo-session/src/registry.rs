//! Aggregate blueprints and the registry that holds them.
//!
//! A blueprint names the root table of an aggregate type and the child
//! tables it owns. Children are joined to the root through a [`Relation`]:
//! `left` columns on the root, `right` columns on the child, paired by
//! position. A child declared without a relation is skipped (with a warning)
//! when the aggregate loads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Column pairs joining a child table to the root table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub left: Vec<String>,
    pub right: Vec<String>,
}

impl Relation {
    pub fn new<L, R>(left: L, right: R) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            left: left.into_iter().map(Into::into).collect(),
            right: right.into_iter().map(Into::into).collect(),
        }
    }

    /// Non-empty and pairwise.
    pub fn is_well_formed(&self) -> bool {
        !self.left.is_empty() && self.left.len() == self.right.len()
    }
}

/// How to build one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateBlueprint {
    name: String,
    root_table: String,
    children: Vec<String>,
    relations: HashMap<String, Relation>,
    auto_commit: bool,
    cascade_on_delete: bool,
}

impl AggregateBlueprint {
    pub fn new(name: impl Into<String>, root_table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_table: root_table.into(),
            children: Vec::new(),
            relations: HashMap::new(),
            auto_commit: false,
            cascade_on_delete: false,
        }
    }

    /// Declare a child table without a relation.
    #[must_use]
    pub fn child(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        if !self.children.contains(&table) {
            self.children.push(table);
        }
        self
    }

    /// Declare a child table joined by `root.left[i] = child.right[i]`.
    #[must_use]
    pub fn relation<L, R>(self, table: impl Into<String>, left: L, right: R) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let table = table.into();
        let mut blueprint = self.child(table.clone());
        blueprint.relations.insert(table, Relation::new(left, right));
        blueprint
    }

    /// Commit instead of cancel when a dirty aggregate ages out.
    #[must_use]
    pub fn auto_commit(mut self, value: bool) -> Self {
        self.auto_commit = value;
        self
    }

    /// Delete owned child rows along with the root.
    #[must_use]
    pub fn cascade_on_delete(mut self, value: bool) -> Self {
        self.cascade_on_delete = value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Child tables in declaration order.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn has_child(&self, table: &str) -> bool {
        self.children.iter().any(|c| c == table)
    }

    pub fn relation_for(&self, table: &str) -> Option<&Relation> {
        self.relations.get(table)
    }

    pub fn default_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn default_cascade_on_delete(&self) -> bool {
        self.cascade_on_delete
    }
}

/// Aggregate name to blueprint.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    blueprints: BTreeMap<String, Arc<AggregateBlueprint>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blueprint, replacing one with the same name.
    pub fn register(&mut self, blueprint: AggregateBlueprint) -> Arc<AggregateBlueprint> {
        let blueprint = Arc::new(blueprint);
        if let Some(old) = self
            .blueprints
            .insert(blueprint.name.clone(), Arc::clone(&blueprint))
        {
            tracing::warn!(aggregate = %old.name, "replacing registered blueprint");
        }
        blueprint
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AggregateBlueprint>> {
        self.blueprints.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AggregateBlueprint>> {
        self.blueprints.values()
    }

    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blueprint_builder() {
        let blueprint = AggregateBlueprint::new("blog", "post")
            .relation("comment", ["id"], ["post_id"])
            .child("tag")
            .child("comment")
            .auto_commit(true);

        assert_eq!(blueprint.root_table(), "post");
        assert_eq!(blueprint.children(), ["comment".to_string(), "tag".to_string()]);
        assert!(blueprint.has_child("tag"));
        assert!(blueprint.relation_for("tag").is_none());
        assert_eq!(
            blueprint.relation_for("comment"),
            Some(&Relation::new(["id"], ["post_id"]))
        );
        assert!(blueprint.default_auto_commit());
        assert!(!blueprint.default_cascade_on_delete());
    }

    #[test]
    fn relation_shape() {
        assert!(Relation::new(["a", "b"], ["c", "d"]).is_well_formed());
        assert!(!Relation::new(["a"], ["c", "d"]).is_well_formed());
        assert!(!Relation::new(Vec::<String>::new(), Vec::<String>::new()).is_well_formed());
    }

    #[test]
    fn registry_replaces_by_name() {
        let mut registry = TypeRegistry::new();
        registry.register(AggregateBlueprint::new("blog", "post"));
        registry.register(AggregateBlueprint::new("blog", "article"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("blog").map(|b| b.root_table()), Some("article"));
        assert!(registry.get("shop").is_none());
    }
}
