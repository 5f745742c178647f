//! Backing store adapters.
//!
//! The interceptor talks to one of these behind the [`Backing`] trait: a
//! real host directory, or an in-memory synthetic tree when the daemon is
//! mounted without `--backing`. Paths are relative to the adapter's root
//! (the empty path names the root itself).

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::time::SystemTime;

use fuser::FileType;
use libc::c_int;

mod dir;
mod mem;

pub use dir::DirBacking;
pub use mem::MemBacking;

/// Attributes of one backing item. The engine supplies the inode number.
#[derive(Debug, Clone, Copy)]
pub struct ItemAttr {
    pub kind: FileType,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct BackingDirEntry {
    pub name: OsString,
    pub kind: FileType,
}

/// Block/file totals for statfs.
#[derive(Debug, Clone, Copy)]
pub struct FsTotals {
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
}

/// The host-side of the passthrough. Every method maps to one syscall-ish
/// operation; errors carry the OS errno where one exists.
pub trait Backing: Send + Sync {
    fn getattr(&self, path: &Path) -> io::Result<ItemAttr>;
    fn create(&self, path: &Path, mode: u32) -> io::Result<ItemAttr>;
    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<ItemAttr>;
    fn read(&self, path: &Path, offset: u64, size: u32) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<u32>;
    fn truncate(&self, path: &Path, size: u64) -> io::Result<()>;
    fn unlink(&self, path: &Path) -> io::Result<()>;
    fn rmdir(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn readdir(&self, path: &Path) -> io::Result<Vec<BackingDirEntry>>;
    fn symlink(&self, path: &Path, target: &Path) -> io::Result<ItemAttr>;
    fn readlink(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn set_times(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()>;
    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>>;
    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8]) -> io::Result<()>;
    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>>;
    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()>;
    /// Total file bytes under `path` (the item's own size for non-dirs).
    fn subtree_size(&self, path: &Path) -> io::Result<u64>;
    fn totals(&self) -> FsTotals;
}

/// Map an io error onto the errno handed back through FUSE. Backing errors
/// propagate verbatim when the OS supplied a code.
pub fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) fn os_err(errno: c_int) -> io::Error {
    io::Error::from_raw_os_error(errno)
}
