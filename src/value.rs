//! # Attribute Values
//!
//! A [`Value`] is the typed payload of an attribute. The variant set is closed
//! and small, so it is a plain enum with exhaustive matches everywhere it is
//! consumed (comparison, formatting, the SQLite codec).
//!
//! ## Nullability
//!
//! Every variant carries an `Option`. `None` is the null value of that type:
//! a null integer is still an integer as far as equality is concerned, but
//! the [`ValueComparer`] treats all nulls alike and sorts them last.
//!
//! ## Ordering
//!
//! Values of different types must be comparable (a query sorting on a column
//! may see a numeric string next to an integer), so ordering is defined by the
//! comparer rather than by the variants' native ordering:
//!
//! ```text
//! Int / Real  <  String  <  DateTime  <  Image  <  null
//! (numeric)      (ordinal)  (chrono)     (bytes)
//! ```

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDateTime;

use crate::error::{Error, Result};

// =============================================================================
// Value Kind
// =============================================================================

/// The type tag of a [`Value`], independent of its payload.
///
/// The raw form is what the secondary store writes in its `kind` column, so
/// the numbers must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Int,
    Real,
    String,
    DateTime,
    Image,
}

impl ValueKind {
    /// Returns the tag stored in the database.
    pub fn as_raw(self) -> i64 {
        match self {
            ValueKind::Int => 1,
            ValueKind::Real => 2,
            ValueKind::String => 3,
            ValueKind::DateTime => 4,
            ValueKind::Image => 5,
        }
    }

    /// Parses a tag read from the database.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(ValueKind::Int),
            2 => Some(ValueKind::Real),
            3 => Some(ValueKind::String),
            4 => Some(ValueKind::DateTime),
            5 => Some(ValueKind::Image),
            _ => None,
        }
    }

    /// Position in the cross-type ordering. Int and Real share a rank because
    /// they compare numerically.
    fn rank(self) -> u8 {
        match self {
            ValueKind::Int | ValueKind::Real => 0,
            ValueKind::String => 1,
            ValueKind::DateTime => 2,
            ValueKind::Image => 3,
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// An immutable, typed attribute value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(Option<i64>),
    Real(Option<f64>),
    String(Option<String>),
    DateTime(Option<NaiveDateTime>),
    Image(Option<Vec<u8>>),
}

impl Value {
    pub fn int(value: i64) -> Self {
        Value::Int(Some(value))
    }

    /// Creates a real value.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for NaN, which has no place in a total order.
    pub fn real(value: f64) -> Result<Self> {
        if value.is_nan() {
            return Err(Error::InvalidArgument(
                "real attribute value must not be NaN".to_string(),
            ));
        }
        Ok(Value::Real(Some(value)))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Value::String(Some(value.into()))
    }

    pub fn date_time(value: NaiveDateTime) -> Self {
        Value::DateTime(Some(value))
    }

    pub fn image(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Image(Some(bytes.into()))
    }

    /// The null value of the given type.
    pub fn null(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Value::Int(None),
            ValueKind::Real => Value::Real(None),
            ValueKind::String => Value::String(None),
            ValueKind::DateTime => Value::DateTime(None),
            ValueKind::Image => Value::Image(None),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Real(_) => ValueKind::Real,
            Value::String(_) => ValueKind::String,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Image(_) => ValueKind::Image,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Int(v) => v.is_none(),
            Value::Real(v) => v.is_none(),
            Value::String(v) => v.is_none(),
            Value::DateTime(v) => v.is_none(),
            Value::Image(v) => v.is_none(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => *v,
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => *v,
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(v) => *v,
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&[u8]> {
        match self {
            Value::Image(v) => v.as_deref(),
            _ => None,
        }
    }

    /// Formats the value for display using `culture`.
    ///
    /// Null values format as the empty string.
    pub fn format(&self, culture: &Culture) -> String {
        match self {
            Value::Int(Some(v)) => v.to_string(),
            Value::Real(Some(v)) => {
                let text = v.to_string();
                if culture.decimal_separator == '.' {
                    text
                } else {
                    text.replace('.', &culture.decimal_separator.to_string())
                }
            }
            Value::String(Some(v)) => v.clone(),
            Value::DateTime(Some(v)) => v.format(&culture.date_format).to_string(),
            Value::Image(Some(bytes)) => format!("<image: {} bytes>", bytes.len()),
            _ => String::new(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => match (a, b) {
                (Some(a), Some(b)) => a.total_cmp(b) == Ordering::Equal,
                (None, None) => true,
                _ => false,
            },
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Image(a), Value::Image(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Agrees with [`ValueComparer`], breaking its ties between different
/// variants (`Int(5)` vs `Real(5.0)`, or two nulls) by variant tag so that
/// `Ord` stays consistent with `Eq`.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        ValueComparer::compare(self, other).then_with(|| self.kind().cmp(&other.kind()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(&Culture::invariant()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Some(v))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::date_time(v)
    }
}

// =============================================================================
// Comparer
// =============================================================================

/// Total order over values of any type.
///
/// - Int and Real compare numerically with each other
/// - Numbers sort before strings, strings before date-times, date-times
///   before images
/// - Nulls sort last, and any two nulls compare equal
pub struct ValueComparer;

impl ValueComparer {
    pub fn compare(a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }

        match (a, b) {
            (Value::Int(Some(x)), Value::Int(Some(y))) => x.cmp(y),
            (Value::Int(Some(x)), Value::Real(Some(y))) => (*x as f64).total_cmp(y),
            (Value::Real(Some(x)), Value::Int(Some(y))) => x.total_cmp(&(*y as f64)),
            (Value::Real(Some(x)), Value::Real(Some(y))) => x.total_cmp(y),
            (Value::String(Some(x)), Value::String(Some(y))) => x.cmp(y),
            (Value::DateTime(Some(x)), Value::DateTime(Some(y))) => x.cmp(y),
            (Value::Image(Some(x)), Value::Image(Some(y))) => {
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            _ => a.kind().rank().cmp(&b.kind().rank()),
        }
    }
}

// =============================================================================
// Culture
// =============================================================================

/// Formatting conventions for displaying values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Culture {
    /// Separator between integer and fractional digits of reals.
    pub decimal_separator: char,
    /// `chrono` format string for date-times.
    pub date_format: String,
}

impl Culture {
    /// Creates a culture with the given conventions.
    pub fn new(decimal_separator: char, date_format: impl Into<String>) -> Self {
        Self {
            decimal_separator,
            date_format: date_format.into(),
        }
    }

    /// Culture-independent conventions: `.` separator, ISO-like dates.
    pub fn invariant() -> Self {
        Self::new('.', "%Y-%m-%d %H:%M:%S")
    }
}

impl Default for Culture {
    fn default() -> Self {
        Self::invariant()
    }
}
