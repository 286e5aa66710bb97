//! The cache dictionary
//!
//! A fixed-capacity, direct-mapped, in-memory attribute cache over a
//! block-streaming source. Batched lookups are served under a read
//! lock; missing or expired entries are refreshed from the source under
//! the write lock, with a per-cell expiry randomized inside the
//! configured lifetime window so entries loaded together do not come up
//! for refresh together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use dictcore::{
    AttributeKind, Column, DictionaryLifetime, DictionarySource, DictionaryStructure, Error,
    Result, StringColumn,
};

use crate::attribute::{AttributeColumn, AttributeDescriptor, DictionaryScalar};
use crate::cell::{CellState, CellTable};
use crate::stats::CacheStats;

/// Mutable cache state guarded by the reader/writer lock as one unit
///
/// The PRNG lives here because it is only touched during refresh, which
/// runs under the write lock.
struct CacheState {
    cells: CellTable,
    columns: Vec<AttributeColumn>,
    rng: StdRng,
}

impl CacheState {
    fn build(capacity: usize, descriptors: &[AttributeDescriptor]) -> Self {
        Self {
            cells: CellTable::new(capacity),
            columns: descriptors
                .iter()
                .map(|descriptor| AttributeColumn::for_kind(descriptor.kind, capacity))
                .collect(),
            rng: StdRng::seed_from_u64(seed()),
        }
    }
}

/// Seed for the TTL jitter engine: clock nanoseconds mixed with the
/// process id. Collisions only affect jitter, not correctness.
fn seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::from(elapsed.subsec_nanos()))
        .unwrap_or_default();
    nanos ^ u64::from(std::process::id())
}

/// A dictionary that caches attribute values for the keys it has seen
///
/// Capacity is fixed at construction (rounded up to a power of two) and
/// each key maps to exactly one slot; a colliding refresh evicts the
/// previous resident. Lookups never block each other; a refresh holds
/// the write lock across the whole source stream so readers never see a
/// half-applied update.
pub struct CacheDictionary {
    name: String,
    structure: DictionaryStructure,
    source: Arc<dyn DictionarySource>,
    lifetime: DictionaryLifetime,
    capacity: usize,
    descriptors: Vec<AttributeDescriptor>,
    attribute_index: HashMap<String, usize, RandomState>,
    hierarchical_attribute: Option<usize>,
    state: RwLock<CacheState>,
    stats: CacheStats,
}

impl CacheDictionary {
    /// Create a cache dictionary over `source`
    ///
    /// The requested `size` is rounded up to a power of two, minimum 1.
    /// Fails with `UnsupportedSource` if the source cannot load by
    /// explicit key list, with `Lifetime` on inverted bounds, and with
    /// `NullValue` when an attribute's null literal does not parse.
    pub fn new(
        name: impl Into<String>,
        structure: DictionaryStructure,
        source: Arc<dyn DictionarySource>,
        lifetime: DictionaryLifetime,
        size: usize,
    ) -> Result<Self> {
        if !source.supports_selective_load() {
            return Err(Error::UnsupportedSource);
        }
        if lifetime.min_sec > lifetime.max_sec {
            return Err(Error::Lifetime {
                min_sec: lifetime.min_sec,
                max_sec: lifetime.max_sec,
            });
        }

        let capacity = size.max(1).next_power_of_two();

        let mut descriptors = Vec::with_capacity(structure.attributes.len());
        let mut attribute_index =
            HashMap::with_capacity_and_hasher(structure.attributes.len(), RandomState::new());
        let mut hierarchical_attribute = None;

        for definition in &structure.attributes {
            let descriptor = AttributeDescriptor::from_definition(definition)?;
            if descriptor.hierarchical {
                hierarchical_attribute = Some(descriptors.len());
            }
            attribute_index.insert(descriptor.name.clone(), descriptors.len());
            descriptors.push(descriptor);
        }

        let state = CacheState::build(capacity, &descriptors);

        Ok(Self {
            name: name.into(),
            structure,
            source,
            lifetime,
            capacity,
            descriptors,
            attribute_index,
            hierarchical_attribute,
            state: RwLock::new(state),
            stats: CacheStats::new(),
        })
    }

    /// Dictionary name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of dictionary this is
    pub fn type_name(&self) -> &'static str {
        "CacheDictionary"
    }

    /// Whether lookups may consult an upstream source (always true)
    pub fn is_cached(&self) -> bool {
        true
    }

    /// This variant declares no hierarchy
    pub fn has_hierarchy(&self) -> bool {
        false
    }

    /// Hierarchical parent of `key`; always 0 here
    pub fn to_parent(&self, _key: u64) -> u64 {
        0
    }

    /// The upstream source handle
    pub fn source(&self) -> &Arc<dyn DictionarySource> {
        &self.source
    }

    /// Configured TTL window
    pub fn lifetime(&self) -> DictionaryLifetime {
        self.lifetime
    }

    /// The declared schema
    pub fn structure(&self) -> &DictionaryStructure {
        &self.structure
    }

    /// Slot count after power-of-two rounding
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hit/miss/refresh counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get one scalar attribute value
    ///
    /// Fails with `UnknownAttribute` for an undeclared name and
    /// `TypeMismatch` when `T` is not the attribute's declared kind.
    /// Key 0 and keys the source does not know yield the attribute's
    /// null value.
    pub fn get<T: DictionaryScalar>(&self, attribute_name: &str, key: u64) -> Result<T> {
        let mut out = Vec::with_capacity(1);
        self.get_batch(attribute_name, &[key], &mut out)?;
        Ok(out[0])
    }

    /// Fill `out` with one scalar value per requested key
    ///
    /// `out` is cleared first and ends up with exactly `keys.len()`
    /// entries, in request order; duplicate keys all receive the same
    /// value.
    pub fn get_batch<T: DictionaryScalar>(
        &self,
        attribute_name: &str,
        keys: &[u64],
        out: &mut Vec<T>,
    ) -> Result<()> {
        let index = self.attribute_index(attribute_name)?;
        let null = T::null(&self.descriptors[index].null)
            .ok_or_else(|| self.kind_mismatch(index, T::KIND))?;

        out.clear();
        out.reserve(keys.len());

        // positions in `out` that still need each key
        let mut outdated: HashMap<u64, Vec<usize>, RandomState> = HashMap::default();
        let mut hits = 0u64;
        let mut misses = 0u64;

        {
            let state = self.state.read();
            let slots = T::slots(&state.columns[index])
                .ok_or_else(|| self.kind_mismatch(index, T::KIND))?;
            let now = Instant::now();

            for (position, &key) in keys.iter().enumerate() {
                if key == 0 {
                    out.push(null);
                    continue;
                }

                let (slot, cell_state) = state.cells.probe(key, now);
                match cell_state {
                    CellState::Hit => {
                        hits += 1;
                        out.push(slots[slot]);
                    }
                    CellState::Stale | CellState::Miss => {
                        misses += 1;
                        out.push(null);
                        outdated.entry(key).or_default().push(position);
                    }
                }
            }
        }

        self.stats.record_hits(hits);
        self.stats.record_misses(misses);

        if outdated.is_empty() {
            return Ok(());
        }

        let required: Vec<u64> = outdated.keys().copied().collect();
        self.refresh(&required, |state, key, slot| {
            let Some(slots) = T::slots(&state.columns[index]) else {
                return;
            };
            let value = slots[slot];

            if let Some(positions) = outdated.get(&key) {
                for &position in positions {
                    out[position] = value;
                }
            }
        })
    }

    /// Get one string attribute value
    pub fn get_string(&self, attribute_name: &str, key: u64) -> Result<Vec<u8>> {
        let mut out = StringColumn::with_capacity(1, 0);
        self.get_string_batch(attribute_name, &[key], &mut out)?;
        Ok(out.get(0).to_vec())
    }

    /// Append one string per requested key to `out`
    ///
    /// Runs an optimistic pass that emits straight into the column and
    /// aborts on the first stale or missing cell; the fallback pass
    /// truncates what the optimistic pass appended (capacity retained),
    /// collects the resident and refreshed strings into a side map
    /// while summing their total length, reserves the column once, and
    /// emits in request order.
    pub fn get_string_batch(
        &self,
        attribute_name: &str,
        keys: &[u64],
        out: &mut StringColumn,
    ) -> Result<()> {
        let index = self.attribute_index(attribute_name)?;
        let descriptor = &self.descriptors[index];
        let null = descriptor
            .null
            .as_string()
            .ok_or_else(|| self.kind_mismatch(index, AttributeKind::String))?;

        out.reserve_rows(keys.len());
        let appended_from = out.len();

        let mut found_outdated = false;
        let mut hits = 0u64;

        {
            let state = self.state.read();
            let now = Instant::now();

            for &key in keys {
                if key == 0 {
                    out.push(null);
                    continue;
                }

                let (slot, cell_state) = state.cells.probe(key, now);
                match cell_state {
                    CellState::Hit => {
                        let value = state.columns[index]
                            .string_at(slot)
                            .ok_or_else(|| self.kind_mismatch(index, AttributeKind::String))?;
                        hits += 1;
                        out.push(value);
                    }
                    CellState::Stale | CellState::Miss => {
                        found_outdated = true;
                        break;
                    }
                }
            }
        }

        if !found_outdated {
            self.stats.record_hits(hits);
            return Ok(());
        }

        // discard the partial optimistic output in place
        out.truncate(appended_from);

        // number of requested positions per outdated key
        let mut outdated: HashMap<u64, usize, RandomState> = HashMap::default();
        // resident and freshly refreshed strings, keyed by id
        let mut found: HashMap<u64, Vec<u8>, RandomState> = HashMap::default();
        let mut total_length = 0usize;
        hits = 0;
        let mut misses = 0u64;

        {
            let state = self.state.read();
            let now = Instant::now();

            for &key in keys {
                if key == 0 {
                    total_length += 1;
                    continue;
                }

                let (slot, cell_state) = state.cells.probe(key, now);
                match cell_state {
                    CellState::Hit => {
                        let value = state.columns[index]
                            .string_at(slot)
                            .ok_or_else(|| self.kind_mismatch(index, AttributeKind::String))?;
                        hits += 1;
                        total_length += value.len() + 1;
                        found.insert(key, value.to_vec());
                    }
                    CellState::Stale | CellState::Miss => {
                        misses += 1;
                        *outdated.entry(key).or_insert(0) += 1;
                    }
                }
            }
        }

        self.stats.record_hits(hits);
        self.stats.record_misses(misses);

        if !outdated.is_empty() {
            let required: Vec<u64> = outdated.keys().copied().collect();
            self.refresh(&required, |state, key, slot| {
                let Some(value) = state.columns[index].string_at(slot) else {
                    return;
                };
                total_length += value.len() + 1;
                found.insert(key, value.to_vec());
            })?;
        }

        out.reserve_bytes(total_length);

        for &key in keys {
            match found.get(&key) {
                Some(value) => out.push(value),
                None => out.push(null),
            }
        }

        Ok(())
    }

    /// Drain one source stream for `keys` under the write lock
    ///
    /// Each returned row is installed into the cell and column arrays
    /// at its key's slot with a freshly randomized expiry, then
    /// `on_updated(key, slot)` runs so the caller can copy the value
    /// out while the lock is still held. Rows for keys that were not
    /// requested are installed all the same; keys the source omits are
    /// simply left unresolved.
    fn refresh<F>(&self, keys: &[u64], mut on_updated: F) -> Result<()>
    where
        F: FnMut(&CacheState, u64, usize),
    {
        debug!(
            "{}: refreshing {} keys from source",
            self.name,
            keys.len()
        );
        self.stats.record_refresh();

        let mut stream = self.source.load_keys(keys)?;
        stream.read_prefix()?;

        let mut guard = self.state.write();
        let state = &mut *guard;

        while let Some(block) = stream.read()? {
            let expected_columns = 1 + self.descriptors.len();
            if block.column_count() != expected_columns {
                return Err(Error::Source(format!(
                    "block has {} columns, expected {}",
                    block.column_count(),
                    expected_columns
                )));
            }

            let key_column = block
                .column(0)
                .ok_or_else(|| Error::Source("block is missing its key column".to_string()))?;
            let block_keys = key_column.as_keys().ok_or_else(|| Error::TypeMismatch {
                attribute: self.structure.id_name.clone(),
                expected: AttributeKind::U64,
                requested: key_column.kind(),
            })?;

            let value_columns: Vec<&Column> = (1..expected_columns)
                .map(|position| block.column(position))
                .collect::<Option<_>>()
                .ok_or_else(|| Error::Source("block is missing attribute columns".to_string()))?;

            let rows = block.rows();
            for (position, column) in value_columns.iter().enumerate() {
                if column.len() != rows {
                    return Err(Error::Source(format!(
                        "column {} has {} rows, key column has {}",
                        position + 1,
                        column.len(),
                        rows
                    )));
                }
            }

            let now = Instant::now();

            for (row, &key) in block_keys.iter().enumerate() {
                let slot = state.cells.slot_of(key);

                for ((column, &values), descriptor) in state
                    .columns
                    .iter_mut()
                    .zip(&value_columns)
                    .zip(&self.descriptors)
                {
                    column.write_row(&descriptor.name, slot, values, row)?;
                }

                let ttl_sec = state
                    .rng
                    .gen_range(self.lifetime.min_sec..=self.lifetime.max_sec);
                state
                    .cells
                    .install(slot, key, now + Duration::from_secs(ttl_sec));

                on_updated(state, key, slot);
            }
        }

        stream.read_suffix()?;
        Ok(())
    }

    fn attribute_index(&self, attribute_name: &str) -> Result<usize> {
        self.attribute_index
            .get(attribute_name)
            .copied()
            .ok_or_else(|| Error::UnknownAttribute(attribute_name.to_string()))
    }

    fn kind_mismatch(&self, index: usize, requested: AttributeKind) -> Error {
        let descriptor = &self.descriptors[index];
        Error::TypeMismatch {
            attribute: descriptor.name.clone(),
            expected: descriptor.kind,
            requested,
        }
    }
}

impl Clone for CacheDictionary {
    /// Deep copy: same schema, lifetime, and configured capacity, a
    /// fresh handle from the source, and empty cells and columns
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            structure: self.structure.clone(),
            source: self.source.clone_source(),
            lifetime: self.lifetime,
            capacity: self.capacity,
            descriptors: self.descriptors.clone(),
            attribute_index: self.attribute_index.clone(),
            hierarchical_attribute: self.hierarchical_attribute,
            state: RwLock::new(CacheState::build(self.capacity, &self.descriptors)),
            stats: CacheStats::new(),
        }
    }
}

macro_rules! scalar_getters {
    ($($t:ty => $single:ident, $batch:ident;)*) => {
        impl CacheDictionary {
            $(
                #[doc = concat!("Get one `", stringify!($t), "` attribute value")]
                pub fn $single(&self, attribute_name: &str, key: u64) -> Result<$t> {
                    self.get::<$t>(attribute_name, key)
                }

                #[doc = concat!("Fill `out` with `", stringify!($t), "` values, one per key")]
                pub fn $batch(
                    &self,
                    attribute_name: &str,
                    keys: &[u64],
                    out: &mut Vec<$t>,
                ) -> Result<()> {
                    self.get_batch::<$t>(attribute_name, keys, out)
                }
            )*
        }
    };
}

scalar_getters! {
    u8 => get_u8, get_u8_batch;
    u16 => get_u16, get_u16_batch;
    u32 => get_u32, get_u32_batch;
    u64 => get_u64, get_u64_batch;
    i8 => get_i8, get_i8_batch;
    i16 => get_i16, get_i16_batch;
    i32 => get_i32, get_i32_batch;
    i64 => get_i64, get_i64_batch;
    f32 => get_f32, get_f32_batch;
    f64 => get_f64, get_f64_batch;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dictcore::{AttributeDefinition, Block, BlockStream, VecBlockStream};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory source over `(key, x: u32, s: string)` rows. Rows can
    /// be added after construction; blocks come back in row order.
    struct TableSource {
        rows: Mutex<Vec<(u64, u32, Vec<u8>)>>,
        calls: Arc<AtomicUsize>,
        selective: bool,
        rows_per_block: usize,
    }

    impl TableSource {
        fn new(rows: &[(u64, u32, &str)]) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(
                    rows.iter()
                        .map(|(key, x, s)| (*key, *x, s.as_bytes().to_vec()))
                        .collect(),
                ),
                calls: Arc::new(AtomicUsize::new(0)),
                selective: true,
                rows_per_block: usize::MAX,
            })
        }

        fn add_row(&self, key: u64, x: u32, s: &str) {
            self.rows.lock().push((key, x, s.as_bytes().to_vec()));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DictionarySource for TableSource {
        fn supports_selective_load(&self) -> bool {
            self.selective
        }

        fn load_keys(&self, keys: &[u64]) -> Result<Box<dyn BlockStream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let rows = self.rows.lock();
            let selected: Vec<(u64, u32, Vec<u8>)> = rows
                .iter()
                .filter(|row| keys.contains(&row.0))
                .cloned()
                .collect();

            let blocks = selected
                .chunks(self.rows_per_block)
                .map(|chunk| {
                    let ids = chunk.iter().map(|row| row.0).collect();
                    let xs = chunk.iter().map(|row| row.1).collect();
                    let mut strings = StringColumn::new();
                    for row in chunk {
                        strings.push(&row.2);
                    }
                    Block::new(vec![
                        Column::U64(ids),
                        Column::U32(xs),
                        Column::String(strings),
                    ])
                })
                .collect();

            Ok(Box::new(VecBlockStream::new(blocks)))
        }

        fn clone_source(&self) -> Arc<dyn DictionarySource> {
            Arc::new(TableSource {
                rows: Mutex::new(self.rows.lock().clone()),
                calls: Arc::clone(&self.calls),
                selective: self.selective,
                rows_per_block: self.rows_per_block,
            })
        }
    }

    fn structure() -> DictionaryStructure {
        DictionaryStructure::new(
            "id",
            vec![
                AttributeDefinition::new("x", AttributeKind::U32, "0"),
                AttributeDefinition::new("s", AttributeKind::String, ""),
            ],
        )
    }

    fn dictionary(
        source: &Arc<TableSource>,
        size: usize,
        min_sec: u64,
        max_sec: u64,
    ) -> CacheDictionary {
        CacheDictionary::new(
            "cities",
            structure(),
            Arc::clone(source) as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(min_sec, max_sec).unwrap(),
            size,
        )
        .unwrap()
    }

    fn slot_of(dictionary: &CacheDictionary, key: u64) -> usize {
        dictionary.state.read().cells.slot_of(key)
    }

    #[test]
    fn test_null_on_zero_key() {
        let source = TableSource::new(&[]);
        let dictionary = dictionary(&source, 4, 10, 10);

        let mut out = Vec::new();
        dictionary.get_u32_batch("x", &[0], &mut out).unwrap();
        assert_eq!(out, vec![0]);

        assert_eq!(dictionary.get_string("s", 0).unwrap(), b"");
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_null_value_literal() {
        let source = TableSource::new(&[]);
        let structure = DictionaryStructure::new(
            "id",
            vec![
                AttributeDefinition::new("x", AttributeKind::U32, "42"),
                AttributeDefinition::new("s", AttributeKind::String, "n/a"),
            ],
        );
        let dictionary = CacheDictionary::new(
            "defaults",
            structure,
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(1, 1).unwrap(),
            4,
        )
        .unwrap();

        // key 0 and unresolved keys both fall back to the literal
        assert_eq!(dictionary.get_u32("x", 0).unwrap(), 42);
        assert_eq!(dictionary.get_u32("x", 9).unwrap(), 42);
        assert_eq!(dictionary.get_string("s", 9).unwrap(), b"n/a");
    }

    #[test]
    fn test_hit_skips_source() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        assert_eq!(dictionary.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 1);

        // fresh entries are served from the cells
        assert_eq!(dictionary.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_batch_order_and_duplicates() {
        let source = TableSource::new(&[(1, 7, "a"), (5, 9, "b")]);
        let dictionary = dictionary(&source, 64, 600, 600);

        let mut out = Vec::new();
        dictionary
            .get_u32_batch("x", &[5, 1, 5, 0, 1], &mut out)
            .unwrap();

        assert_eq!(out, vec![9, 7, 9, 0, 7]);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_unknown_attribute() {
        let source = TableSource::new(&[]);
        let dictionary = dictionary(&source, 4, 10, 10);

        assert_eq!(
            dictionary.get_u32("nope", 1),
            Err(Error::UnknownAttribute("nope".to_string()))
        );
    }

    #[test]
    fn test_type_mismatch_without_source_call() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 10, 10);

        assert_eq!(
            dictionary.get_u64("x", 1),
            Err(Error::TypeMismatch {
                attribute: "x".to_string(),
                expected: AttributeKind::U32,
                requested: AttributeKind::U64,
            })
        );
        assert_eq!(
            dictionary.get_string("x", 1).unwrap_err(),
            Error::TypeMismatch {
                attribute: "x".to_string(),
                expected: AttributeKind::U32,
                requested: AttributeKind::String,
            }
        );
        assert!(dictionary.get::<i32>("s", 1).is_err());
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_unsupported_source() {
        let source = Arc::new(TableSource {
            rows: Mutex::new(Vec::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            selective: false,
            rows_per_block: usize::MAX,
        });

        let result = CacheDictionary::new(
            "cities",
            structure(),
            source as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(10, 10).unwrap(),
            4,
        );
        assert_eq!(result.err(), Some(Error::UnsupportedSource));
    }

    #[test]
    fn test_inverted_lifetime_rejected() {
        let source = TableSource::new(&[]);
        let result = CacheDictionary::new(
            "cities",
            structure(),
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            DictionaryLifetime {
                min_sec: 60,
                max_sec: 10,
            },
            4,
        );
        assert_eq!(
            result.err(),
            Some(Error::Lifetime {
                min_sec: 60,
                max_sec: 10
            })
        );
    }

    #[test]
    fn test_missing_key_is_not_cached() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        let mut out = Vec::new();
        dictionary.get_u32_batch("x", &[5], &mut out).unwrap();
        assert_eq!(out, vec![0]);
        assert_eq!(source.calls(), 1);

        // no negative caching: the key is asked for again
        dictionary.get_u32_batch("x", &[5], &mut out).unwrap();
        assert_eq!(out, vec![0]);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_collision_evicts_previous_resident() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        // find a second key sharing key 1's slot in this instance
        let slot = slot_of(&dictionary, 1);
        let other = (2u64..)
            .find(|&key| slot_of(&dictionary, key) == slot)
            .unwrap();
        source.add_row(other, 9, "b");

        let mut out = Vec::new();
        dictionary
            .get_u32_batch("x", &[1, other, 1], &mut out)
            .unwrap();

        // every position gets its own key's value even though the two
        // keys fight over one slot within the same refresh
        assert_eq!(out, vec![7, 9, 7]);
        assert_eq!(source.calls(), 1);

        // rows come back in row order, so the colliding key won
        assert_eq!(dictionary.state.read().cells.cell(slot).key, other);

        // the evicted key misses and goes back to the source
        assert_eq!(dictionary.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 2);
        assert_eq!(dictionary.state.read().cells.cell(slot).key, 1);
    }

    #[test]
    fn test_string_duplicates_share_one_refresh() {
        let source = TableSource::new(&[(1, 7, "hi")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        let mut out = StringColumn::new();
        dictionary
            .get_string_batch("s", &[1, 1, 1], &mut out)
            .unwrap();

        let values: Vec<&[u8]> = out.iter().collect();
        assert_eq!(values, vec![&b"hi"[..], &b"hi"[..], &b"hi"[..]]);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_string_two_phase_outputs_match() {
        let source = TableSource::new(&[(10, 1, "alpha"), (20, 2, "beta")]);
        let dictionary = dictionary(&source, 64, 600, 600);

        // all keys missing: the optimistic pass aborts immediately
        let mut pessimistic = StringColumn::new();
        dictionary
            .get_string_batch("s", &[10, 20, 10, 0], &mut pessimistic)
            .unwrap();
        assert_eq!(source.calls(), 1);

        // all keys resident: the optimistic pass completes
        let mut optimistic = StringColumn::new();
        dictionary
            .get_string_batch("s", &[10, 20, 10, 0], &mut optimistic)
            .unwrap();
        assert_eq!(source.calls(), 1);

        assert_eq!(pessimistic, optimistic);
        let values: Vec<&[u8]> = optimistic.iter().collect();
        assert_eq!(
            values,
            vec![&b"alpha"[..], &b"beta"[..], &b"alpha"[..], &b""[..]]
        );
    }

    #[test]
    fn test_string_mid_batch_miss_falls_back() {
        let source = TableSource::new(&[(10, 1, "alpha"), (20, 2, "beta")]);
        let dictionary = dictionary(&source, 64, 600, 600);

        // make key 10 resident so the optimistic pass appends it first
        assert_eq!(dictionary.get_string("s", 10).unwrap(), b"alpha");
        assert_eq!(source.calls(), 1);

        let mut out = StringColumn::new();
        out.push(b"already here");
        dictionary
            .get_string_batch("s", &[10, 20, 10], &mut out)
            .unwrap();

        // the fallback refreshed only key 20 and did not disturb the
        // column's prior contents
        assert_eq!(source.calls(), 2);
        let values: Vec<&[u8]> = out.iter().collect();
        assert_eq!(
            values,
            vec![&b"already here"[..], &b"alpha"[..], &b"beta"[..], &b"alpha"[..]]
        );
    }

    #[test]
    fn test_empty_string_is_cached() {
        let source = TableSource::new(&[(1, 7, "")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        assert_eq!(dictionary.get_string("s", 1).unwrap(), b"");
        assert_eq!(source.calls(), 1);

        // the empty-string sentinel is a resident value, not a miss
        assert_eq!(dictionary.get_string("s", 1).unwrap(), b"");
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_expired_entry_refreshes_again() {
        let source = TableSource::new(&[(1, 7, "hi")]);
        let dictionary = dictionary(&source, 4, 0, 0);

        // a zero lifetime expires entries the moment they land
        assert_eq!(dictionary.get_string("s", 1).unwrap(), b"hi");
        assert_eq!(source.calls(), 1);

        assert_eq!(dictionary.get_string("s", 1).unwrap(), b"hi");
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_ttl_within_lifetime_window() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 10, 20);

        dictionary.get_u32("x", 1).unwrap();

        let state = dictionary.state.read();
        let (slot, cell_state) = state.cells.probe(1, Instant::now());
        assert_eq!(cell_state, CellState::Hit);

        let remaining = state
            .cells
            .cell(slot)
            .expires_at
            .saturating_duration_since(Instant::now());
        assert!(remaining <= Duration::from_secs(20));
        assert!(remaining >= Duration::from_secs(9));
    }

    #[test]
    fn test_multi_block_stream() {
        let source = Arc::new(TableSource {
            rows: Mutex::new(vec![
                (1, 10, b"one".to_vec()),
                (2, 20, b"two".to_vec()),
                (3, 30, b"three".to_vec()),
            ]),
            calls: Arc::new(AtomicUsize::new(0)),
            selective: true,
            rows_per_block: 1,
        });
        let dictionary = dictionary(&source, 64, 600, 600);

        let mut out = Vec::new();
        dictionary.get_u32_batch("x", &[3, 1, 2], &mut out).unwrap();
        assert_eq!(out, vec![30, 10, 20]);
        assert_eq!(source.calls(), 1);

        let mut strings = StringColumn::new();
        dictionary
            .get_string_batch("s", &[1, 2, 3], &mut strings)
            .unwrap();
        let values: Vec<&[u8]> = strings.iter().collect();
        assert_eq!(values, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert_eq!(source.calls(), 1);
    }

    /// Source whose stream yields one good block, then fails.
    struct FlakySource {
        row: (u64, u32, Vec<u8>),
    }

    struct FlakyStream {
        first: Option<Block>,
    }

    impl BlockStream for FlakyStream {
        fn read(&mut self) -> Result<Option<Block>> {
            match self.first.take() {
                Some(block) => Ok(Some(block)),
                None => Err(Error::Source("connection reset".to_string())),
            }
        }
    }

    impl DictionarySource for FlakySource {
        fn supports_selective_load(&self) -> bool {
            true
        }

        fn load_keys(&self, _keys: &[u64]) -> Result<Box<dyn BlockStream>> {
            let mut strings = StringColumn::new();
            strings.push(&self.row.2);
            let block = Block::new(vec![
                Column::U64(vec![self.row.0]),
                Column::U32(vec![self.row.1]),
                Column::String(strings),
            ]);
            Ok(Box::new(FlakyStream { first: Some(block) }))
        }

        fn clone_source(&self) -> Arc<dyn DictionarySource> {
            Arc::new(FlakySource {
                row: self.row.clone(),
            })
        }
    }

    #[test]
    fn test_source_failure_keeps_partial_refresh() {
        let source: Arc<dyn DictionarySource> = Arc::new(FlakySource {
            row: (1, 7, b"a".to_vec()),
        });
        let dictionary = CacheDictionary::new(
            "cities",
            structure(),
            source,
            DictionaryLifetime::new(600, 600).unwrap(),
            64,
        )
        .unwrap();

        let mut out = Vec::new();
        let err = dictionary
            .get_u32_batch("x", &[1, 2], &mut out)
            .unwrap_err();
        assert_eq!(err, Error::Source("connection reset".to_string()));

        // the block that arrived before the failure stays installed
        assert_eq!(dictionary.get_u32("x", 1).unwrap(), 7);
    }

    /// Source that mislabels its key column.
    struct BadKeySource;

    impl DictionarySource for BadKeySource {
        fn supports_selective_load(&self) -> bool {
            true
        }

        fn load_keys(&self, _keys: &[u64]) -> Result<Box<dyn BlockStream>> {
            let mut strings = StringColumn::new();
            strings.push(b"a");
            let block = Block::new(vec![
                Column::I64(vec![1]),
                Column::U32(vec![7]),
                Column::String(strings),
            ]);
            Ok(Box::new(VecBlockStream::new(vec![block])))
        }

        fn clone_source(&self) -> Arc<dyn DictionarySource> {
            Arc::new(BadKeySource)
        }
    }

    #[test]
    fn test_non_u64_key_column_rejected() {
        let dictionary = CacheDictionary::new(
            "cities",
            structure(),
            Arc::new(BadKeySource) as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(600, 600).unwrap(),
            4,
        )
        .unwrap();

        assert_eq!(
            dictionary.get_u32("x", 1),
            Err(Error::TypeMismatch {
                attribute: "id".to_string(),
                expected: AttributeKind::U64,
                requested: AttributeKind::I64,
            })
        );
    }

    /// Source that returns blocks without the attribute columns.
    struct ShortBlockSource;

    impl DictionarySource for ShortBlockSource {
        fn supports_selective_load(&self) -> bool {
            true
        }

        fn load_keys(&self, keys: &[u64]) -> Result<Box<dyn BlockStream>> {
            let block = Block::new(vec![Column::U64(keys.to_vec())]);
            Ok(Box::new(VecBlockStream::new(vec![block])))
        }

        fn clone_source(&self) -> Arc<dyn DictionarySource> {
            Arc::new(ShortBlockSource)
        }
    }

    #[test]
    fn test_short_block_rejected() {
        let dictionary = CacheDictionary::new(
            "cities",
            structure(),
            Arc::new(ShortBlockSource) as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(600, 600).unwrap(),
            4,
        )
        .unwrap();

        assert!(matches!(
            dictionary.get_u32("x", 1),
            Err(Error::Source(_))
        ));
    }

    #[test]
    fn test_clone_starts_empty() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let original = dictionary(&source, 4, 600, 600);

        assert_eq!(original.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 1);

        let copy = original.clone();
        assert_eq!(copy.name(), original.name());
        assert_eq!(copy.capacity(), original.capacity());
        assert_eq!(copy.lifetime(), original.lifetime());
        assert_eq!(copy.structure(), original.structure());

        // no cell contents were carried over
        assert_eq!(copy.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 2);

        // the original is untouched and still serves from residency
        assert_eq!(original.get_u32("x", 1).unwrap(), 7);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_capacity_rounds_up() {
        let source = TableSource::new(&[]);
        assert_eq!(dictionary(&source, 5, 10, 10).capacity(), 8);
        assert_eq!(dictionary(&source, 8, 10, 10).capacity(), 8);
        assert_eq!(dictionary(&source, 0, 10, 10).capacity(), 1);
    }

    #[test]
    fn test_dictionary_flags() {
        let source = TableSource::new(&[]);
        let dictionary = dictionary(&source, 4, 10, 10);

        assert_eq!(dictionary.name(), "cities");
        assert_eq!(dictionary.type_name(), "CacheDictionary");
        assert!(dictionary.is_cached());
        assert!(!dictionary.has_hierarchy());
        assert_eq!(dictionary.to_parent(42), 0);
    }

    #[test]
    fn test_hierarchical_flag_is_inert() {
        let source = TableSource::new(&[]);
        let mut schema = structure();
        schema.attributes[0].hierarchical = true;

        let dictionary = CacheDictionary::new(
            "cities",
            schema,
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            DictionaryLifetime::new(10, 10).unwrap(),
            4,
        )
        .unwrap();

        assert_eq!(dictionary.hierarchical_attribute, Some(0));
        assert!(!dictionary.has_hierarchy());
        assert_eq!(dictionary.to_parent(1), 0);
    }

    #[test]
    fn test_stats_counters() {
        let source = TableSource::new(&[(1, 7, "a")]);
        let dictionary = dictionary(&source, 4, 600, 600);

        dictionary.get_u32("x", 1).unwrap(); // miss + refresh
        dictionary.get_u32("x", 1).unwrap(); // hit

        assert_eq!(dictionary.stats().misses(), 1);
        assert_eq!(dictionary.stats().hits(), 1);
        assert_eq!(dictionary.stats().refreshes(), 1);
        assert_eq!(dictionary.stats().hit_ratio(), 0.5);
    }

    #[test]
    fn test_shared_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CacheDictionary>();

        let source = TableSource::new(&[(1, 10, "one"), (2, 20, "two"), (3, 30, "three")]);
        let dictionary = dictionary(&source, 64, 600, 600);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let mut out = Vec::new();
                        dictionary
                            .get_u32_batch("x", &[1, 2, 3, 0], &mut out)
                            .unwrap();
                        assert_eq!(out, vec![10, 20, 30, 0]);

                        let mut strings = StringColumn::new();
                        dictionary
                            .get_string_batch("s", &[3, 1], &mut strings)
                            .unwrap();
                        assert_eq!(strings.get(0), b"three");
                        assert_eq!(strings.get(1), b"one");
                    }
                });
            }
        });

        // at most one refresh per thread before everything is resident
        let calls = source.calls();
        assert!((1..=4).contains(&calls));
    }
}
