//! Source collaborator interfaces
//!
//! A dictionary source materializes attribute values for a set of keys
//! as a stream of columnar blocks. How the data is fetched (database,
//! file, service) is the source's business; the cache only drives the
//! stream.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::Block;
use crate::error::Result;

/// An iterator over the blocks of one source answer
///
/// The prefix/suffix hooks bracket the stream so sources can open and
/// release their underlying resources at well-defined points.
pub trait BlockStream {
    /// Signal start-of-stream
    fn read_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next block, or `None` once the stream is drained
    fn read(&mut self) -> Result<Option<Block>>;

    /// Signal end-of-stream
    fn read_suffix(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An upstream provider of dictionary data
pub trait DictionarySource: Send + Sync {
    /// Whether the source can materialize attributes for an explicit
    /// key list. A cache dictionary refuses sources that cannot.
    fn supports_selective_load(&self) -> bool;

    /// Start a block stream covering the given keys
    ///
    /// The source may return rows in any order, split across any number
    /// of blocks, and may omit keys it does not know.
    fn load_keys(&self, keys: &[u64]) -> Result<Box<dyn BlockStream>>;

    /// Obtain a fresh handle to the same underlying source
    fn clone_source(&self) -> Arc<dyn DictionarySource>;
}

/// A block stream over an in-memory sequence of blocks
///
/// Convenient for sources that materialize their whole answer up front.
pub struct VecBlockStream {
    blocks: VecDeque<Block>,
}

impl VecBlockStream {
    /// Wrap pre-built blocks into a stream
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: blocks.into(),
        }
    }
}

impl BlockStream for VecBlockStream {
    fn read(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Column;

    #[test]
    fn test_vec_block_stream_drains_in_order() {
        let first = Block::new(vec![Column::U64(vec![1])]);
        let second = Block::new(vec![Column::U64(vec![2, 3])]);
        let mut stream = VecBlockStream::new(vec![first.clone(), second.clone()]);

        stream.read_prefix().unwrap();
        assert_eq!(stream.read().unwrap(), Some(first));
        assert_eq!(stream.read().unwrap(), Some(second));
        assert_eq!(stream.read().unwrap(), None);
        stream.read_suffix().unwrap();
    }
}
