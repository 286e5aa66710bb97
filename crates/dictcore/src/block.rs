//! Columnar blocks exchanged with a dictionary source
//!
//! A `Block` is one batch of a source's answer: a u64 key column at
//! position 0 followed by one value column per declared attribute, all
//! aligned row-wise.

use crate::schema::AttributeKind;

/// A variable-length byte column: flat character storage plus end offsets
///
/// String `i` occupies `chars[offsets[i - 1]..offsets[i]]` (with an
/// implicit 0 for the first entry). Strings are stored by exact length,
/// without terminators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringColumn {
    chars: Vec<u8>,
    offsets: Vec<usize>,
}

impl StringColumn {
    /// Create an empty column
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty column with room for `rows` entries and `bytes`
    /// characters
    pub fn with_capacity(rows: usize, bytes: usize) -> Self {
        Self {
            chars: Vec::with_capacity(bytes),
            offsets: Vec::with_capacity(rows),
        }
    }

    /// Append one string to the end of the column
    pub fn push(&mut self, value: &[u8]) {
        self.chars.extend_from_slice(value);
        self.offsets.push(self.chars.len());
    }

    /// Get the string at `index`
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> &[u8] {
        let start = if index == 0 { 0 } else { self.offsets[index - 1] };
        &self.chars[start..self.offsets[index]]
    }

    /// Number of strings in the column
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Check whether the column holds no strings
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Discard all strings while retaining reserved capacity
    ///
    /// This is the truncation primitive an optimistic writer relies on
    /// to drop a partial result without giving back its allocation.
    pub fn clear(&mut self) {
        self.chars.clear();
        self.offsets.clear();
    }

    /// Drop every string past the first `len`, retaining reserved
    /// capacity
    ///
    /// Lets an optimistic writer discard exactly what it appended
    /// without disturbing entries that were already present.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.offsets.len() {
            return;
        }
        let end = if len == 0 { 0 } else { self.offsets[len - 1] };
        self.chars.truncate(end);
        self.offsets.truncate(len);
    }

    /// Reserve room for `additional` more entries
    pub fn reserve_rows(&mut self, additional: usize) {
        self.offsets.reserve(additional);
    }

    /// Reserve room for `additional` more character bytes
    pub fn reserve_bytes(&mut self, additional: usize) {
        self.chars.reserve(additional);
    }

    /// Iterate over the strings in order
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// One typed column of a block
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Unsigned 8-bit values
    U8(Vec<u8>),
    /// Unsigned 16-bit values
    U16(Vec<u16>),
    /// Unsigned 32-bit values
    U32(Vec<u32>),
    /// Unsigned 64-bit values
    U64(Vec<u64>),
    /// Signed 8-bit values
    I8(Vec<i8>),
    /// Signed 16-bit values
    I16(Vec<i16>),
    /// Signed 32-bit values
    I32(Vec<i32>),
    /// Signed 64-bit values
    I64(Vec<i64>),
    /// 32-bit float values
    F32(Vec<f32>),
    /// 64-bit float values
    F64(Vec<f64>),
    /// Variable-length byte strings
    String(StringColumn),
}

impl Column {
    /// The kind of value this column holds
    pub fn kind(&self) -> AttributeKind {
        match self {
            Column::U8(_) => AttributeKind::U8,
            Column::U16(_) => AttributeKind::U16,
            Column::U32(_) => AttributeKind::U32,
            Column::U64(_) => AttributeKind::U64,
            Column::I8(_) => AttributeKind::I8,
            Column::I16(_) => AttributeKind::I16,
            Column::I32(_) => AttributeKind::I32,
            Column::I64(_) => AttributeKind::I64,
            Column::F32(_) => AttributeKind::F32,
            Column::F64(_) => AttributeKind::F64,
            Column::String(_) => AttributeKind::String,
        }
    }

    /// Number of rows in the column
    pub fn len(&self) -> usize {
        match self {
            Column::U8(v) => v.len(),
            Column::U16(v) => v.len(),
            Column::U32(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::I8(v) => v.len(),
            Column::I16(v) => v.len(),
            Column::I32(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::F64(v) => v.len(),
            Column::String(v) => v.len(),
        }
    }

    /// View the column as a u64 key vector, if that is its type
    pub fn as_keys(&self) -> Option<&[u64]> {
        match self {
            Column::U64(v) => Some(v),
            _ => None,
        }
    }
}

/// One batch of rows returned by a source stream
///
/// Column 0 is the u64 key column; columns `1..=A` carry the values of
/// the `A` declared attributes, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    columns: Vec<Column>,
}

impl Block {
    /// Assemble a block from positional columns
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Column at `position`, if present
    pub fn column(&self, position: usize) -> Option<&Column> {
        self.columns.get(position)
    }

    /// Number of columns, key column included
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows, taken from the key column
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }
}
