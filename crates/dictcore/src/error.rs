//! Error types for the dictionary subsystem

use std::fmt;

use crate::schema::AttributeKind;

/// Result type alias for dictionary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for dictionary operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The source does not support selective load by keys
    UnsupportedSource,

    /// Requested attribute is not declared in the structure
    UnknownAttribute(String),

    /// Requested value type differs from the declared attribute kind,
    /// or a source block carried a key column that is not u64
    TypeMismatch {
        /// Attribute (or key column) the request named
        attribute: String,
        /// Kind declared in the structure
        expected: AttributeKind,
        /// Kind the caller or the source supplied
        requested: AttributeKind,
    },

    /// Null value literal does not parse under the attribute's kind
    NullValue {
        /// Attribute whose definition is malformed
        attribute: String,
        /// The offending literal
        value: String,
    },

    /// Lifetime bounds are inverted (min above max)
    Lifetime {
        /// Configured lower bound, seconds
        min_sec: u64,
        /// Configured upper bound, seconds
        max_sec: u64,
    },

    /// The source stream failed or produced a malformed block
    Source(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedSource => {
                write!(f, "source cannot be used with a cache dictionary")
            }
            Error::UnknownAttribute(name) => write!(f, "no such attribute '{}'", name),
            Error::TypeMismatch {
                attribute,
                expected,
                requested,
            } => write!(
                f,
                "type mismatch: attribute '{}' has type {}, requested {}",
                attribute, expected, requested
            ),
            Error::NullValue { attribute, value } => write!(
                f,
                "cannot parse null value '{}' for attribute '{}'",
                value, attribute
            ),
            Error::Lifetime { min_sec, max_sec } => write!(
                f,
                "invalid lifetime: min {}s exceeds max {}s",
                min_sec, max_sec
            ),
            Error::Source(msg) => write!(f, "source failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
