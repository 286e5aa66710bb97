//! Typed per-attribute column storage
//!
//! Each declared attribute owns one contiguous array with as many slots
//! as the cell table, typed from the closed kind set. A slot's value is
//! only meaningful while the cell at the same index is live and fresh;
//! validating that is the lookup engine's job.

use dictcore::{AttributeDefinition, AttributeKind, Column, Error, Result};

/// Typed default substituted for key 0 and unresolved keys
#[derive(Debug, Clone, PartialEq)]
pub enum NullValue {
    /// u8 default
    U8(u8),
    /// u16 default
    U16(u16),
    /// u32 default
    U32(u32),
    /// u64 default
    U64(u64),
    /// i8 default
    I8(i8),
    /// i16 default
    I16(i16),
    /// i32 default
    I32(i32),
    /// i64 default
    I64(i64),
    /// f32 default
    F32(f32),
    /// f64 default
    F64(f64),
    /// String default, owned by the descriptor
    String(Box<[u8]>),
}

macro_rules! parse_null {
    ($attribute:expr, $literal:expr, $t:ty, $variant:ident) => {{
        // an omitted literal means the type's own default
        if $literal.is_empty() {
            Ok(NullValue::$variant(<$t>::default()))
        } else {
            $literal
                .parse::<$t>()
                .map(NullValue::$variant)
                .map_err(|_| Error::NullValue {
                    attribute: $attribute.to_string(),
                    value: $literal.to_string(),
                })
        }
    }};
}

impl NullValue {
    /// Parse a human-readable null literal under the given kind
    pub fn parse(attribute: &str, kind: AttributeKind, literal: &str) -> Result<Self> {
        match kind {
            AttributeKind::U8 => parse_null!(attribute, literal, u8, U8),
            AttributeKind::U16 => parse_null!(attribute, literal, u16, U16),
            AttributeKind::U32 => parse_null!(attribute, literal, u32, U32),
            AttributeKind::U64 => parse_null!(attribute, literal, u64, U64),
            AttributeKind::I8 => parse_null!(attribute, literal, i8, I8),
            AttributeKind::I16 => parse_null!(attribute, literal, i16, I16),
            AttributeKind::I32 => parse_null!(attribute, literal, i32, I32),
            AttributeKind::I64 => parse_null!(attribute, literal, i64, I64),
            AttributeKind::F32 => parse_null!(attribute, literal, f32, F32),
            AttributeKind::F64 => parse_null!(attribute, literal, f64, F64),
            AttributeKind::String => Ok(NullValue::String(literal.as_bytes().into())),
        }
    }

    /// View the string default, if this is a string null
    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            NullValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Immutable per-attribute data living outside the lock
#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    /// Attribute name
    pub name: String,

    /// Declared value kind
    pub kind: AttributeKind,

    /// Parsed typed default
    pub null: NullValue,

    /// Hierarchical flag, remembered but unused by the cache variant
    pub hierarchical: bool,
}

impl AttributeDescriptor {
    /// Build a descriptor from a schema definition, parsing its null
    /// value literal
    pub fn from_definition(definition: &AttributeDefinition) -> Result<Self> {
        let null = NullValue::parse(&definition.name, definition.kind, &definition.null_value)?;

        Ok(Self {
            name: definition.name.clone(),
            kind: definition.kind,
            null,
            hierarchical: definition.hierarchical,
        })
    }
}

/// The mutable slot array of one attribute, living inside the lock
///
/// String slots own their byte buffers; `None` is the empty-string
/// sentinel. Overwriting a slot drops the previous buffer.
#[derive(Debug)]
pub enum AttributeColumn {
    /// u8 slots
    U8(Box<[u8]>),
    /// u16 slots
    U16(Box<[u16]>),
    /// u32 slots
    U32(Box<[u32]>),
    /// u64 slots
    U64(Box<[u64]>),
    /// i8 slots
    I8(Box<[i8]>),
    /// i16 slots
    I16(Box<[i16]>),
    /// i32 slots
    I32(Box<[i32]>),
    /// i64 slots
    I64(Box<[i64]>),
    /// f32 slots
    F32(Box<[f32]>),
    /// f64 slots
    F64(Box<[f64]>),
    /// String slots, `None` meaning the empty string
    String(Box<[Option<Box<[u8]>>]>),
}

impl AttributeColumn {
    /// Allocate a zeroed column of `capacity` slots for the given kind
    pub fn for_kind(kind: AttributeKind, capacity: usize) -> Self {
        match kind {
            AttributeKind::U8 => AttributeColumn::U8(vec![0; capacity].into()),
            AttributeKind::U16 => AttributeColumn::U16(vec![0; capacity].into()),
            AttributeKind::U32 => AttributeColumn::U32(vec![0; capacity].into()),
            AttributeKind::U64 => AttributeColumn::U64(vec![0; capacity].into()),
            AttributeKind::I8 => AttributeColumn::I8(vec![0; capacity].into()),
            AttributeKind::I16 => AttributeColumn::I16(vec![0; capacity].into()),
            AttributeKind::I32 => AttributeColumn::I32(vec![0; capacity].into()),
            AttributeKind::I64 => AttributeColumn::I64(vec![0; capacity].into()),
            AttributeKind::F32 => AttributeColumn::F32(vec![0.0; capacity].into()),
            AttributeKind::F64 => AttributeColumn::F64(vec![0.0; capacity].into()),
            AttributeKind::String => AttributeColumn::String(vec![None; capacity].into()),
        }
    }

    /// The kind of value this column stores
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeColumn::U8(_) => AttributeKind::U8,
            AttributeColumn::U16(_) => AttributeKind::U16,
            AttributeColumn::U32(_) => AttributeKind::U32,
            AttributeColumn::U64(_) => AttributeKind::U64,
            AttributeColumn::I8(_) => AttributeKind::I8,
            AttributeColumn::I16(_) => AttributeKind::I16,
            AttributeColumn::I32(_) => AttributeKind::I32,
            AttributeColumn::I64(_) => AttributeKind::I64,
            AttributeColumn::F32(_) => AttributeKind::F32,
            AttributeColumn::F64(_) => AttributeKind::F64,
            AttributeColumn::String(_) => AttributeKind::String,
        }
    }

    /// Install one value from a source block column into `slot`
    ///
    /// Only legal under the write lock. The block column must carry the
    /// same kind as the attribute. For strings, the previous buffer is
    /// dropped; an empty string stores the sentinel.
    pub fn write_row(
        &mut self,
        attribute: &str,
        slot: usize,
        column: &Column,
        row: usize,
    ) -> Result<()> {
        match (self, column) {
            (AttributeColumn::U8(slots), Column::U8(values)) => slots[slot] = values[row],
            (AttributeColumn::U16(slots), Column::U16(values)) => slots[slot] = values[row],
            (AttributeColumn::U32(slots), Column::U32(values)) => slots[slot] = values[row],
            (AttributeColumn::U64(slots), Column::U64(values)) => slots[slot] = values[row],
            (AttributeColumn::I8(slots), Column::I8(values)) => slots[slot] = values[row],
            (AttributeColumn::I16(slots), Column::I16(values)) => slots[slot] = values[row],
            (AttributeColumn::I32(slots), Column::I32(values)) => slots[slot] = values[row],
            (AttributeColumn::I64(slots), Column::I64(values)) => slots[slot] = values[row],
            (AttributeColumn::F32(slots), Column::F32(values)) => slots[slot] = values[row],
            (AttributeColumn::F64(slots), Column::F64(values)) => slots[slot] = values[row],
            (AttributeColumn::String(slots), Column::String(values)) => {
                let value = values.get(row);
                slots[slot] = if value.is_empty() {
                    None
                } else {
                    Some(value.into())
                };
            }
            (this, column) => {
                return Err(Error::TypeMismatch {
                    attribute: attribute.to_string(),
                    expected: this.kind(),
                    requested: column.kind(),
                })
            }
        }

        Ok(())
    }

    /// View the string at `slot`, or `None` if this is not a string
    /// column. The empty-string sentinel reads back as `b""`.
    pub fn string_at(&self, slot: usize) -> Option<&[u8]> {
        match self {
            AttributeColumn::String(slots) => Some(slots[slot].as_deref().unwrap_or(b"")),
            _ => None,
        }
    }
}

mod sealed {
    /// Closes `DictionaryScalar` to the ten scalar kinds.
    pub trait Sealed {}
}

/// A Rust scalar type that corresponds to one attribute kind
///
/// Implemented for exactly the ten scalar members of the closed kind
/// set; this is what makes `CacheDictionary::get::<T>` reject a request
/// whose type does not match the attribute's declaration.
pub trait DictionaryScalar: sealed::Sealed + Copy {
    /// The kind tag this type corresponds to
    const KIND: AttributeKind;

    /// Extract the typed null default, if the kinds agree
    #[doc(hidden)]
    fn null(value: &NullValue) -> Option<Self>;

    /// View the typed slot array, if the kinds agree
    #[doc(hidden)]
    fn slots(column: &AttributeColumn) -> Option<&[Self]>;
}

macro_rules! impl_dictionary_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}

            impl DictionaryScalar for $t {
                const KIND: AttributeKind = AttributeKind::$variant;

                fn null(value: &NullValue) -> Option<Self> {
                    match value {
                        NullValue::$variant(v) => Some(*v),
                        _ => None,
                    }
                }

                fn slots(column: &AttributeColumn) -> Option<&[Self]> {
                    match column {
                        AttributeColumn::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_dictionary_scalar! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}
