use serde::{Deserialize, Serialize};
use serde_json::Value; // Record fields are arbitrary JSON values
use std::collections::HashMap;
use std::fmt;
use thiserror::Error; // For domain-specific errors

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Field '{field}' must not be empty")]
    EmptyField { field: &'static str },
    #[error("Field '{field}' exceeds the maximum length of {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// --- Record ID ---

/// Store-assigned integer identifier. Monotonically increasing within a
/// store; never reused, even after the record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// --- Record ---

/// A single stored item/task: an id plus a mapping of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    /// Record data stored as field name -> JSON value pairs.
    fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(id: RecordId, fields: HashMap<String, Value>) -> Self {
        Self { id, fields }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }

    /// Gets a specific field's value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Gets a field as a string slice, if present and textual.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Gets a field as a number, if present and numeric.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    /// Merges a partial update into the record: only the keys present in
    /// `patch` are overwritten, every other field is left untouched.
    /// An empty patch is a no-op.
    pub fn apply_patch(&mut self, patch: HashMap<String, Value>) {
        for (name, value) in patch {
            self.fields.insert(name, value);
        }
    }
}

// --- Field validation helpers ---

/// Checks that a text field is non-empty (after trimming) and within `max`
/// characters.
pub fn require_text(field: &'static str, value: &str, max: usize) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::EmptyField { field });
    }
    if value.chars().count() > max {
        return Err(DomainError::TooLong { field, max });
    }
    Ok(())
}

/// Checks that an optional text field, when present, stays within `max`
/// characters. Empty strings are allowed here.
pub fn require_text_within(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), DomainError> {
    if value.chars().count() > max {
        return Err(DomainError::TooLong { field, max });
    }
    Ok(())
}

/// Checks that a numeric field is strictly positive.
pub fn require_positive(field: &'static str, value: f64) -> Result<(), DomainError> {
    if !(value > 0.0) {
        return Err(DomainError::InvalidValue {
            field,
            reason: format!("must be greater than 0, got {}", value),
        });
    }
    Ok(())
}

/// Checks that an integer field falls inside an inclusive range.
pub fn require_in_range(
    field: &'static str,
    value: i64,
    min: i64,
    max: i64,
) -> Result<(), DomainError> {
    if value < min || value > max {
        return Err(DomainError::InvalidValue {
            field,
            reason: format!("must be between {} and {}, got {}", min, max, value),
        });
    }
    Ok(())
}
