//! Platform file-system capabilities.
//!
//! The few primitives that differ per OS sit behind one trait so the
//! callback surface stays platform-neutral. The kernel filter itself is a
//! separate collaborator (see [`super::filter`]); this trait is only about
//! plain file I/O semantics.

use std::{fs::File, io, path::Path};

/// Per-OS file-system primitives.
pub trait PlatformFs: Send + Sync {
    /// Atomically move `from` over `to`, replacing any existing file.
    fn move_and_overwrite(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Flush file buffers through to stable storage.
    fn flush(&self, file: &File) -> io::Result<()>;

    /// True when `path` is a symlink (without following it).
    fn is_symlink(&self, path: &Path) -> bool;

    /// Whether the file system records an executable bit.
    fn supports_file_mode(&self) -> bool;

    /// Whether the serialized status cache can be used on this platform.
    fn supports_status_cache(&self) -> bool;
}

/// POSIX implementation.
pub struct UnixFs;

impl PlatformFs for UnixFs {
    fn move_and_overwrite(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn flush(&self, file: &File) -> io::Result<()> {
        file.sync_all()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        path.symlink_metadata()
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn supports_file_mode(&self) -> bool {
        true
    }

    fn supports_status_cache(&self) -> bool {
        true
    }
}

/// Windows implementation surface; replace-by-rename needs MoveFileEx
/// semantics there.
#[cfg(windows)]
pub struct WindowsFs;

#[cfg(windows)]
impl PlatformFs for WindowsFs {
    fn move_and_overwrite(&self, from: &Path, to: &Path) -> io::Result<()> {
        if to.exists() {
            std::fs::remove_file(to)?;
        }
        std::fs::rename(from, to)
    }

    fn flush(&self, file: &File) -> io::Result<()> {
        file.sync_all()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        path.symlink_metadata()
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn supports_file_mode(&self) -> bool {
        false
    }

    fn supports_status_cache(&self) -> bool {
        true
    }
}

/// The implementation for the build target.
pub fn default_platform() -> Box<dyn PlatformFs> {
    #[cfg(windows)]
    {
        Box::new(WindowsFs)
    }
    #[cfg(not(windows))]
    {
        Box::new(UnixFs)
    }
}
