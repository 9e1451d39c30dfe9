//! The kernel filter driver seam.
//!
//! The driver is an opaque collaborator: it intercepts file-system requests
//! against the virtualized directory and calls back into the engine. The
//! engine only needs to start it, stop it, and hand it bytes; everything
//! else flows through the callback methods on [`super::Virtualizer`].

use async_trait::async_trait;

use crate::{errors::GvfsError, object::EntryMode, oid::ObjectId};

/// What the driver needs to materialize a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub oid: ObjectId,
    pub mode: EntryMode,
    pub size: u64,
    pub is_directory: bool,
}

/// One row of an enumeration reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub mode: EntryMode,
}

/// Where `get_file_stream` writes hydrated bytes; the driver's reply buffer.
#[async_trait]
pub trait ByteSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), GvfsError>;
}

/// A sink collecting into memory, for tests and diagnostics.
#[derive(Default)]
pub struct BufferSink {
    pub bytes: Vec<u8>,
    pub chunks: usize,
}

#[async_trait]
impl ByteSink for BufferSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), GvfsError> {
        self.bytes.extend_from_slice(chunk);
        self.chunks += 1;
        Ok(())
    }
}

/// The platform filter driver: attach/detach only. Callbacks arrive through
/// the engine methods, serialized per path by the driver itself.
#[async_trait]
pub trait FilterDriver: Send + Sync {
    /// Attach the filter to the virtualization root.
    async fn start(&self) -> Result<(), GvfsError>;

    /// Detach; pending callbacks have been drained by the engine first.
    async fn stop(&self) -> Result<(), GvfsError>;
}

/// A driver that attaches nothing; functional tests drive the engine
/// directly.
pub struct NullFilterDriver;

#[async_trait]
impl FilterDriver for NullFilterDriver {
    async fn start(&self) -> Result<(), GvfsError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), GvfsError> {
        Ok(())
    }
}
