//! # dictcore
//!
//! Shared vocabulary of the dictionary subsystem.
//!
//! ## Contents
//! - **Schema**: `DictionaryStructure` declares the key column and the
//!   typed attributes a dictionary serves
//! - **Blocks**: columnar batches (`Block`, `Column`, `StringColumn`)
//!   exchanged with a source
//! - **Sources**: the `DictionarySource` / `BlockStream` collaborator
//!   interfaces
//! - **Errors**: the subsystem-wide `Error` and `Result`

#![warn(missing_docs)]

mod block;
mod error;
mod schema;
mod source;

pub use block::{Block, Column, StringColumn};
pub use error::{Error, Result};
pub use schema::{AttributeDefinition, AttributeKind, DictionaryLifetime, DictionaryStructure};
pub use source::{BlockStream, DictionarySource, VecBlockStream};
