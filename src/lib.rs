//! GVFS-Core is the mount-time virtualization engine of a Git virtual file system.
//!
//! It projects a parsed Git index into a working directory as placeholder
//! entries, hydrates file contents on first read from a remote object service,
//! journals user-modified paths, and keeps the shared object cache healthy
//! through background maintenance. Kernel filter drivers and the CLI talk to
//! it through the traits in [`virtualize`] and the pipe router in [`ipc`].
pub mod cache;
pub mod config;
pub mod enlistment;
pub mod errors;
pub mod gitproc;
pub mod http;
pub mod index;
pub mod ipc;
pub mod journal;
pub mod lock;
pub mod maintenance;
pub mod mount;
pub mod object;
pub mod oid;
pub mod trace;
pub mod util;
pub mod virtualize;
pub mod zlib;

pub use errors::GvfsError;
pub use oid::ObjectId;
