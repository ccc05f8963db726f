//! Column range predicates pushed down to tablet servers.

use crate::error::{ClientError, Result};
use crate::schema::{ColumnSchema, Value};

/// `lower <= value <= upper` on one column; either bound may be open.
///
/// Bounds use the column type's native ordering. For strings that is
/// byte-lexicographic, so every value that starts with `lower` satisfies
/// the lower bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRangePredicate {
    column: ColumnSchema,
    lower: Option<Value>,
    upper: Option<Value>,
}

impl ColumnRangePredicate {
    pub fn new(column: ColumnSchema, lower: Option<Value>, upper: Option<Value>) -> Result<Self> {
        for bound in lower.iter().chain(upper.iter()) {
            if bound.data_type() != Some(column.data_type) {
                return Err(ClientError::invalid_argument(format!(
                    "predicate bound {bound} does not match type {} of column {}",
                    column.data_type, column.name
                )));
            }
        }
        Ok(Self {
            column,
            lower,
            upper,
        })
    }

    pub fn column(&self) -> &ColumnSchema {
        &self.column
    }

    pub fn lower(&self) -> Option<&Value> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Value> {
        self.upper.as_ref()
    }

    /// Nulls never match a range.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        let above_lower = match &self.lower {
            Some(lower) => value.compare(lower).is_some_and(|ord| ord.is_ge()),
            None => true,
        };
        let below_upper = match &self.upper {
            Some(upper) => value.compare(upper).is_some_and(|ord| ord.is_le()),
            None => true,
        };
        above_lower && below_upper
    }
}
