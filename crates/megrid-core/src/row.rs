use std::collections::HashMap;

use crate::expr::{Row, VarRef};

/// One cell of a table row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Scalar(f64),
    Array(Vec<f64>),
}

/// A materialized table row, keyed by column name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowData {
    columns: HashMap<String, Value>,
}

impl RowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: &str, value: Value) {
        self.columns.insert(column.to_string(), value);
    }

    pub fn with(mut self, column: &str, value: Value) -> Self {
        self.insert(column, value);
        self
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn scalar(&self, column: &str) -> Option<f64> {
        match self.columns.get(column)? {
            Value::Scalar(v) => Some(*v),
            Value::Array(a) => a.first().copied(),
            Value::Null => None,
        }
    }

    pub fn array(&self, column: &str) -> Option<&[f64]> {
        match self.columns.get(column)? {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn element(&self, column: &str, index: usize) -> Option<f64> {
        match self.columns.get(column)? {
            Value::Array(a) => a.get(index).copied(),
            Value::Scalar(v) if index == 0 => Some(*v),
            _ => None,
        }
    }
}

impl Row for RowData {
    fn value(&self, var: &VarRef) -> Option<f64> {
        match var.index {
            Some(i) => self.element(&var.column, i),
            None => self.scalar(&var.column),
        }
    }
}
