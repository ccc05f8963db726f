//! Column schema, cell values, the client-side row buffer and key encoding.
//!
//! Keys are encoded into an order-preserving byte string so that tablet
//! ranges (`[start_key, end_key)`) can be compared with plain byte
//! comparison, the same way range routing treats keys elsewhere.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClientError, Result};

const SIGN_FLIP_MASK: u64 = 1u64 << 63;
const KEY_STRING_ESCAPE: u8 = 0x01;
const KEY_STRING_TERMINATOR: [u8; 2] = [0x00, 0x00];

/// Physical column type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    UInt32,
    Int64,
    String,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One cell value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    UInt32(u32),
    Int64(i64),
    String(String),
}

impl Value {
    /// `None` for `Null`, which fits any nullable column.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::UInt32(_) => Some(DataType::UInt32),
            Self::Int64(_) => Some(DataType::Int64),
            Self::String(_) => Some(DataType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Native ordering between two non-null values of the same type.
    ///
    /// Strings compare byte-lexicographically. Returns `None` for nulls and
    /// mismatched types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::UInt32(a), Self::UInt32(b)) => Some(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }

    /// Approximate wire footprint, used against scan batch-size budgets.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::UInt32(_) => 4,
            Self::Int64(_) => 8,
            Self::String(v) => v.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::UInt32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Check that `value` may be stored in this column.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        match value.data_type() {
            None if self.nullable => Ok(()),
            None => Err(ClientError::invalid_argument(format!(
                "column {} is not nullable",
                self.name
            ))),
            Some(actual) if actual == self.data_type => Ok(()),
            Some(actual) => Err(ClientError::invalid_argument(format!(
                "column {} has type {} but value has type {actual}",
                self.name, self.data_type
            ))),
        }
    }
}

/// Ordered columns; the first `num_key_columns` form the primary key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if num_key_columns > columns.len() {
            return Err(ClientError::invalid_argument(format!(
                "schema declares {num_key_columns} key columns but has {} columns",
                columns.len()
            )));
        }
        for (idx, column) in columns.iter().enumerate() {
            if idx < num_key_columns && column.nullable {
                return Err(ClientError::invalid_argument(format!(
                    "key column {} must not be nullable",
                    column.name
                )));
            }
            if columns[..idx].iter().any(|other| other.name == column.name) {
                return Err(ClientError::invalid_argument(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
        }
        Ok(Self {
            columns,
            num_key_columns,
        })
    }

    /// Zero columns; scanning with it yields zero-width rows.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            num_key_columns: 0,
        }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    /// Projection containing only the key columns.
    pub fn key_projection(&self) -> Schema {
        Schema {
            columns: self.key_columns().to_vec(),
            num_key_columns: self.num_key_columns,
        }
    }

    /// Projection of the named columns, in the given order.
    pub fn project(&self, names: &[&str]) -> Result<Schema> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.find_column(name).ok_or_else(|| {
                ClientError::invalid_argument(format!("No such column: {name}"))
            })?;
            columns.push(self.columns[idx].clone());
        }
        Ok(Schema {
            columns,
            num_key_columns: 0,
        })
    }
}

/// Row buffer addressed by column name; tracks which cells were set.
#[derive(Clone, Debug)]
pub struct PartialRow {
    schema: Arc<Schema>,
    cells: Vec<Option<Value>>,
}

impl PartialRow {
    pub fn new(schema: Arc<Schema>) -> Self {
        let cells = vec![None; schema.num_columns()];
        Self { schema, cells }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let idx = self
            .schema
            .find_column(name)
            .ok_or_else(|| ClientError::invalid_argument(format!("No such column: {name}")))?;
        let column = &self.schema.columns[idx];
        if value.is_null() && idx < self.schema.num_key_columns {
            return Err(ClientError::invalid_argument(format!(
                "key column {name} may not be null"
            )));
        }
        column.check_value(&value)?;
        self.cells[idx] = Some(value);
        Ok(())
    }

    pub fn set_u32(&mut self, name: &str, value: u32) -> Result<()> {
        self.set(name, Value::UInt32(value))
    }

    pub fn set_i64(&mut self, name: &str, value: i64) -> Result<()> {
        self.set(name, Value::Int64(value))
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.set(name, Value::String(value.into()))
    }

    pub fn set_null(&mut self, name: &str) -> Result<()> {
        self.set(name, Value::Null)
    }

    pub fn unset(&mut self, name: &str) -> Result<()> {
        let idx = self
            .schema
            .find_column(name)
            .ok_or_else(|| ClientError::invalid_argument(format!("No such column: {name}")))?;
        self.cells[idx] = None;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.schema.find_column(name)?;
        self.cells[idx].as_ref()
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_key_set(&self) -> bool {
        self.cells[..self.schema.num_key_columns]
            .iter()
            .all(Option::is_some)
    }

    /// Set cells in schema order.
    pub fn set_cells(&self) -> impl Iterator<Item = (&ColumnSchema, &Value)> {
        self.schema
            .columns
            .iter()
            .zip(self.cells.iter())
            .filter_map(|(column, cell)| cell.as_ref().map(|value| (column, value)))
    }

    /// Order-preserving encoding of the key cells.
    pub fn encoded_key(&self) -> Result<Bytes> {
        let mut key_values = Vec::with_capacity(self.schema.num_key_columns);
        for (column, cell) in self.schema.key_columns().iter().zip(self.cells.iter()) {
            let value = cell.as_ref().ok_or_else(|| {
                ClientError::illegal_state(format!("key column {} is not set", column.name))
            })?;
            key_values.push(value.clone());
        }
        encode_key(&self.schema, &key_values)
    }
}

impl fmt::Display for PartialRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (column, value) in self.set_cells() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} {}={}", column.data_type, column.name, value)?;
        }
        Ok(())
    }
}

/// Encode a full key tuple (one value per key column) into its ordered form.
pub fn encode_key(schema: &Schema, key_values: &[Value]) -> Result<Bytes> {
    let key_columns = schema.key_columns();
    if key_values.len() != key_columns.len() {
        return Err(ClientError::invalid_argument(format!(
            "expected {} key values, got {}",
            key_columns.len(),
            key_values.len()
        )));
    }

    let mut out = BytesMut::new();
    let last = key_columns.len().saturating_sub(1);
    for (idx, (column, value)) in key_columns.iter().zip(key_values).enumerate() {
        column.check_value(value)?;
        match value {
            Value::UInt32(v) => out.put_u32(*v),
            Value::Int64(v) => out.put_u64(*v as u64 ^ SIGN_FLIP_MASK),
            Value::String(v) if idx == last => out.put_slice(v.as_bytes()),
            Value::String(v) => {
                for byte in v.as_bytes() {
                    out.put_u8(*byte);
                    if *byte == 0 {
                        out.put_u8(KEY_STRING_ESCAPE);
                    }
                }
                out.put_slice(&KEY_STRING_TERMINATOR);
            }
            Value::Null => {
                return Err(ClientError::invalid_argument(format!(
                    "key column {} may not be null",
                    column.name
                )))
            }
        }
    }
    Ok(out.freeze())
}
