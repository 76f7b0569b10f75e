//! ORDER BY and select-modifier clauses.

use serde::{Deserialize, Serialize};

/// ORDER BY clause over a bare or `table.column` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    column: String,
    direction: OrderDirection,
    nulls: Option<NullsOrder>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// Explicit placement of NULLs in a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullsOrder {
    First,
    Last,
}

impl OrderBy {
    /// Sort `column` ascending.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
            nulls: None,
        }
    }

    /// Sort `column` descending.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
            nulls: None,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(NullsOrder::First);
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullsOrder::Last);
        self
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    /// Where NULLs sort. Defaults to first for ascending, last for descending.
    pub fn nulls(&self) -> NullsOrder {
        self.nulls.unwrap_or(match self.direction {
            OrderDirection::Asc => NullsOrder::First,
            OrderDirection::Desc => NullsOrder::Last,
        })
    }

    /// Render this clause, e.g. `post.created DESC NULLS LAST`.
    pub fn to_sql(&self) -> String {
        let direction = match self.direction {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        };
        match self.nulls {
            Some(NullsOrder::First) => format!("{} {direction} NULLS FIRST", self.column),
            Some(NullsOrder::Last) => format!("{} {direction} NULLS LAST", self.column),
            None => format!("{} {direction}", self.column),
        }
    }
}

/// Modifier placed between SELECT and the column list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SelectModifier {
    Distinct,
    All,
}

impl SelectModifier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SelectModifier::Distinct => "DISTINCT",
            SelectModifier::All => "ALL",
        }
    }
}

/// Split `table.column` into its parts; a bare name has no table.
pub fn split_column(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((table, column)) => (Some(table), column),
        None => (None, name),
    }
}
