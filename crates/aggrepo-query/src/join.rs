//! Join conditions.

use serde::{Deserialize, Serialize};

/// An equi-join between two `table.column` names.
///
/// Joins are used to reach a child table through its parent: selecting from
/// `comment` with `Join::new("post.id", "comment.post_id")` and a predicate on
/// `post.id` yields the comments of one post.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Join {
    pub left: String,
    pub right: String,
}

impl Join {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }

    /// Build one join per column pair between two tables.
    ///
    /// Returns `None` when the lists are empty or of different lengths.
    pub fn between(
        left_table: &str,
        left_columns: &[String],
        right_table: &str,
        right_columns: &[String],
    ) -> Option<Vec<Join>> {
        if left_columns.is_empty() || left_columns.len() != right_columns.len() {
            return None;
        }
        Some(
            left_columns
                .iter()
                .zip(right_columns)
                .map(|(l, r)| {
                    Join::new(
                        format!("{}.{}", left_table, l),
                        format!("{}.{}", right_table, r),
                    )
                })
                .collect(),
        )
    }

    /// Tables named on either side (bare names have no table).
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        [self.left.as_str(), self.right.as_str()]
            .into_iter()
            .filter_map(|name| name.split_once('.').map(|(t, _)| t))
    }

    pub fn to_sql(&self) -> String {
        format!("{} = {}", self.left, self.right)
    }
}
