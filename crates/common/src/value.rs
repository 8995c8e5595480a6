use serde::{Deserialize, Serialize};

/// A tagged value that crosses the binding boundary between the sandbox and
/// the host storage backends. Converted at each binding entry/exit point;
/// anything that doesn't fit one of these variants is rejected with
/// `invalid-argument`.
///
/// `integer` and `real` are kept distinct (rather than collapsing into one
/// `number`) because the relational binding needs to round-trip SQLite's own
/// INTEGER/REAL distinction through prepared-statement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WireValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl WireValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<i64> for WireValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for WireValue {
    fn from(f: f64) -> Self {
        Self::Real(f)
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
