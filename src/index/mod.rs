//! Git index parsing and the directory projection derived from it.
//!
//! [`format`] reads index versions 2 through 4 off disk; [`projection`] turns
//! the flat entry list into per-directory listings and owns the published
//! snapshot the callback surface reads.

pub mod format;
pub mod projection;

pub use format::{IndexEntry, IndexSignature, parse_index};
pub use projection::{ListedEntry, ProjectedEntry, ProjectedTree, Projector};
