use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dynamically typed AMQP value used for properties, message ids and bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AmqpValue {
    #[default]
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    ULong(u64),
    Double(f64),
    String(String),
    Symbol(String),
    Binary(Vec<u8>),
    List(Vec<AmqpValue>),
    Map(BTreeMap<String, AmqpValue>),
}

/// Ordered key/value set used for attach, open and application properties.
pub type AmqpProperties = BTreeMap<String, AmqpValue>;

impl AmqpValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AmqpValue::Null)
    }

    /// Borrows the text of a `String` or `Symbol` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(s) | AmqpValue::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Reads any integral value as `i64`, rejecting values that do not fit.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AmqpValue::Int(v) => Some(i64::from(*v)),
            AmqpValue::Long(v) => Some(*v),
            AmqpValue::ULong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmqpValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for AmqpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmqpValue::Null => write!(f, "null"),
            AmqpValue::Boolean(v) => write!(f, "{v}"),
            AmqpValue::Int(v) => write!(f, "{v}"),
            AmqpValue::Long(v) => write!(f, "{v}"),
            AmqpValue::ULong(v) => write!(f, "{v}"),
            AmqpValue::Double(v) => write!(f, "{v}"),
            AmqpValue::String(v) | AmqpValue::Symbol(v) => write!(f, "{v}"),
            AmqpValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
            AmqpValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            AmqpValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for AmqpValue {
    fn from(v: bool) -> Self {
        AmqpValue::Boolean(v)
    }
}

impl From<i32> for AmqpValue {
    fn from(v: i32) -> Self {
        AmqpValue::Int(v)
    }
}

impl From<i64> for AmqpValue {
    fn from(v: i64) -> Self {
        AmqpValue::Long(v)
    }
}

impl From<u32> for AmqpValue {
    fn from(v: u32) -> Self {
        AmqpValue::ULong(u64::from(v))
    }
}

impl From<u64> for AmqpValue {
    fn from(v: u64) -> Self {
        AmqpValue::ULong(v)
    }
}

impl From<f64> for AmqpValue {
    fn from(v: f64) -> Self {
        AmqpValue::Double(v)
    }
}

impl From<&str> for AmqpValue {
    fn from(v: &str) -> Self {
        AmqpValue::String(v.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(v: String) -> Self {
        AmqpValue::String(v)
    }
}

impl From<Vec<u8>> for AmqpValue {
    fn from(v: Vec<u8>) -> Self {
        AmqpValue::Binary(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_accessors() {
        assert_eq!(AmqpValue::Int(200).as_i64(), Some(200));
        assert_eq!(AmqpValue::ULong(202).as_i64(), Some(202));
        assert_eq!(AmqpValue::ULong(u64::MAX).as_i64(), None);
        assert_eq!(AmqpValue::from("200").as_i64(), None);
    }

    #[test]
    fn test_display_is_used_as_correlation_key() {
        assert_eq!(AmqpValue::ULong(17).to_string(), "17");
        assert_eq!(AmqpValue::from("abc").to_string(), "abc");
    }
}
