//! # Attributes
//!
//! An [`Attribute`] pairs a name with a [`Value`] and records where it came
//! from. Equality and ordering look at the name and the value only; the
//! provenance tag decides whether an editor may change it.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::value::Value;

/// Where an attribute came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeSource {
    /// Set by the user; editable.
    Custom,
    /// Derived from the file itself (dimensions, thumbnail); read-only.
    Metadata,
}

impl AttributeSource {
    pub fn as_raw(self) -> i64 {
        match self {
            AttributeSource::Custom => 0,
            AttributeSource::Metadata => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(AttributeSource::Custom),
            1 => Some(AttributeSource::Metadata),
            _ => None,
        }
    }
}

/// A named, typed, provenance-tagged value.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    value: Value,
    source: AttributeSource,
}

impl Attribute {
    /// Creates an attribute.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `name` is empty.
    pub fn new(name: impl Into<String>, value: Value, source: AttributeSource) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "attribute name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            value,
            source,
        })
    }

    /// Shorthand for a user-editable attribute.
    pub fn custom(name: impl Into<String>, value: Value) -> Result<Self> {
        Self::new(name, value, AttributeSource::Custom)
    }

    /// Shorthand for a read-only attribute derived from the file.
    pub fn metadata(name: impl Into<String>, value: Value) -> Result<Self> {
        Self::new(name, value, AttributeSource::Metadata)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn source(&self) -> AttributeSource {
        self.source
    }

    pub fn is_editable(&self) -> bool {
        self.source == AttributeSource::Custom
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Attribute {}

impl PartialOrd for Attribute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Attribute {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}
