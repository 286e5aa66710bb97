//! Dictionary schema declaration
//!
//! A `DictionaryStructure` names the key column and declares the typed
//! attributes a dictionary serves. It is the configuration surface a
//! surrounding registry deserializes and hands to the cache at
//! construction time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Closed set of value types an attribute can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Variable-length byte string
    String,
}

impl AttributeKind {
    /// Human-readable name, used in error messages
    pub fn name(self) -> &'static str {
        match self {
            AttributeKind::U8 => "u8",
            AttributeKind::U16 => "u16",
            AttributeKind::U32 => "u32",
            AttributeKind::U64 => "u64",
            AttributeKind::I8 => "i8",
            AttributeKind::I16 => "i16",
            AttributeKind::I32 => "i32",
            AttributeKind::I64 => "i64",
            AttributeKind::F32 => "f32",
            AttributeKind::F64 => "f64",
            AttributeKind::String => "string",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared attribute: a named, typed column provided by the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Attribute name, unique within the structure
    pub name: String,

    /// Value type of the attribute
    pub kind: AttributeKind,

    /// Default returned for key 0 and unresolved keys, as a
    /// human-readable literal parsed per `kind` at construction
    #[serde(default)]
    pub null_value: String,

    /// Marks the attribute as hierarchical. Remembered but unused by
    /// the cache variant, which declares no hierarchy.
    #[serde(default)]
    pub hierarchical: bool,
}

impl AttributeDefinition {
    /// Shorthand constructor for a non-hierarchical attribute
    pub fn new(name: impl Into<String>, kind: AttributeKind, null_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            null_value: null_value.into(),
            hierarchical: false,
        }
    }
}

/// Schema of a dictionary: the key column name and the attribute list
///
/// Attribute order is fixed at declaration time and matches the
/// positional layout of source blocks (key column first, then one
/// column per attribute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryStructure {
    /// Name of the u64 key column
    pub id_name: String,

    /// Declared attributes, in source block order
    pub attributes: Vec<AttributeDefinition>,
}

impl DictionaryStructure {
    /// Create a structure with the given key column name and attributes
    pub fn new(id_name: impl Into<String>, attributes: Vec<AttributeDefinition>) -> Self {
        Self {
            id_name: id_name.into(),
            attributes,
        }
    }
}

/// Bounds on the randomized per-cell time-to-live, in seconds
///
/// Each refreshed cell expires at a uniformly random point within
/// `[min_sec, max_sec]` from the moment it is written, spreading future
/// refreshes of entries loaded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryLifetime {
    /// Lower TTL bound, seconds
    pub min_sec: u64,

    /// Upper TTL bound, seconds
    pub max_sec: u64,
}

impl DictionaryLifetime {
    /// Create a lifetime, rejecting inverted bounds
    pub fn new(min_sec: u64, max_sec: u64) -> Result<Self> {
        if min_sec > max_sec {
            return Err(Error::Lifetime { min_sec, max_sec });
        }
        Ok(Self { min_sec, max_sec })
    }
}
