//! Row mutations buffered by a write session.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::rpc::{ColumnValue, RowOperation};
use crate::schema::PartialRow;
use crate::table_locator::Table;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// A single insert, update or delete against one table.
///
/// Created open and mutable through [`MutationOp::row_mut`]; moved into a
/// [`crate::WriteSession`] by a successful `apply`.
#[derive(Clone, Debug)]
pub struct MutationOp {
    op_type: OpType,
    table: Arc<Table>,
    row: PartialRow,
}

impl MutationOp {
    pub(crate) fn new(op_type: OpType, table: Arc<Table>) -> Self {
        let row = PartialRow::new(table.schema().clone());
        Self {
            op_type,
            table,
            row,
        }
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn row(&self) -> &PartialRow {
        &self.row
    }

    pub fn row_mut(&mut self) -> &mut PartialRow {
        &mut self.row
    }

    /// Wire form: the op type plus every set cell, addressed by column name.
    pub(crate) fn to_wire(&self) -> Result<RowOperation> {
        Ok(RowOperation {
            op_type: self.op_type,
            key: self.row.encoded_key()?,
            cells: self
                .row
                .set_cells()
                .map(|(column, value)| ColumnValue {
                    name: column.name.clone(),
                    value: value.clone(),
                })
                .collect(),
        })
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op_type, self.row)
    }
}
