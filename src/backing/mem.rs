//! In-memory synthetic backing store.
//!
//! Used when the daemon is mounted without `--backing`, and by tests that
//! want a hermetic tree. Items are keyed by relative path; the empty path
//! is the root directory.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fuser::FileType;
use parking_lot::Mutex;

use super::{Backing, BackingDirEntry, FsTotals, ItemAttr, os_err};

struct MemItem {
    kind: FileType,
    /// File contents, or the symlink target bytes.
    data: Vec<u8>,
    mode: u32,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
}

impl MemItem {
    fn new(kind: FileType, mode: u32) -> MemItem {
        let now = SystemTime::now();
        MemItem {
            kind,
            data: Vec::new(),
            mode,
            xattrs: BTreeMap::new(),
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

pub struct MemBacking {
    items: Mutex<BTreeMap<PathBuf, MemItem>>,
    uid: u32,
    gid: u32,
}

impl MemBacking {
    pub fn new() -> MemBacking {
        let mut items = BTreeMap::new();
        items.insert(PathBuf::new(), MemItem::new(FileType::Directory, 0o755));
        MemBacking {
            items: Mutex::new(items),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr_of(&self, item: &MemItem) -> ItemAttr {
        ItemAttr {
            kind: item.kind,
            size: match item.kind {
                FileType::Directory => 0,
                _ => item.data.len() as u64,
            },
            perm: (item.mode & 0o7777) as u16,
            nlink: if item.kind == FileType::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            atime: item.atime,
            mtime: item.mtime,
            ctime: item.ctime,
        }
    }

    fn parent_exists(items: &BTreeMap<PathBuf, MemItem>, path: &Path) -> io::Result<()> {
        let parent = path.parent().unwrap_or(Path::new(""));
        match items.get(parent) {
            Some(item) if item.kind == FileType::Directory => Ok(()),
            Some(_) => Err(os_err(libc::ENOTDIR)),
            None => Err(os_err(libc::ENOENT)),
        }
    }

    fn insert_new(&self, path: &Path, item: MemItem) -> io::Result<ItemAttr> {
        let mut items = self.items.lock();
        Self::parent_exists(&items, path)?;
        if items.contains_key(path) {
            return Err(os_err(libc::EEXIST));
        }
        let attr = self.attr_of(&item);
        items.insert(path.to_path_buf(), item);
        Ok(attr)
    }

    fn has_children(items: &BTreeMap<PathBuf, MemItem>, path: &Path) -> bool {
        items
            .keys()
            .any(|k| k.parent() == Some(path) && k != path)
    }
}

impl Default for MemBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl Backing for MemBacking {
    fn getattr(&self, path: &Path) -> io::Result<ItemAttr> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        Ok(self.attr_of(item))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<ItemAttr> {
        self.insert_new(path, MemItem::new(FileType::RegularFile, mode))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<ItemAttr> {
        self.insert_new(path, MemItem::new(FileType::Directory, mode))
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if item.kind == FileType::Directory {
            return Err(os_err(libc::EISDIR));
        }
        let start = (offset as usize).min(item.data.len());
        let end = (start + size as usize).min(item.data.len());
        Ok(item.data[start..end].to_vec())
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<u32> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if item.kind == FileType::Directory {
            return Err(os_err(libc::EISDIR));
        }
        let end = offset as usize + data.len();
        if item.data.len() < end {
            item.data.resize(end, 0);
        }
        item.data[offset as usize..end].copy_from_slice(data);
        item.mtime = SystemTime::now();
        Ok(data.len() as u32)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if item.kind == FileType::Directory {
            return Err(os_err(libc::EISDIR));
        }
        item.data.resize(size as usize, 0);
        item.mtime = SystemTime::now();
        Ok(())
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        let mut items = self.items.lock();
        match items.get(path) {
            Some(item) if item.kind == FileType::Directory => Err(os_err(libc::EISDIR)),
            Some(_) => {
                items.remove(path);
                Ok(())
            }
            None => Err(os_err(libc::ENOENT)),
        }
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        let mut items = self.items.lock();
        match items.get(path) {
            Some(item) if item.kind != FileType::Directory => Err(os_err(libc::ENOTDIR)),
            Some(_) => {
                if Self::has_children(&items, path) {
                    return Err(os_err(libc::ENOTEMPTY));
                }
                items.remove(path);
                Ok(())
            }
            None => Err(os_err(libc::ENOENT)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut items = self.items.lock();
        if !items.contains_key(from) {
            return Err(os_err(libc::ENOENT));
        }
        Self::parent_exists(&items, to)?;
        if let Some(existing) = items.get(to) {
            if existing.kind == FileType::Directory && Self::has_children(&items, to) {
                return Err(os_err(libc::ENOTEMPTY));
            }
        }
        // Re-key the item and, for directories, every descendant.
        let moved: Vec<PathBuf> = items
            .keys()
            .filter(|k| *k == from || k.starts_with(from))
            .cloned()
            .collect();
        items.remove(to);
        for old in moved {
            if let Some(item) = items.remove(&old) {
                let new = if old == from {
                    to.to_path_buf()
                } else {
                    to.join(old.strip_prefix(from).unwrap_or(&old))
                };
                items.insert(new, item);
            }
        }
        Ok(())
    }

    fn readdir(&self, path: &Path) -> io::Result<Vec<BackingDirEntry>> {
        let items = self.items.lock();
        match items.get(path) {
            Some(item) if item.kind == FileType::Directory => {}
            Some(_) => return Err(os_err(libc::ENOTDIR)),
            None => return Err(os_err(libc::ENOENT)),
        }
        Ok(items
            .iter()
            .filter(|(k, _)| k.parent() == Some(path) && *k != path)
            .filter_map(|(k, v)| {
                k.file_name().map(|name| BackingDirEntry {
                    name: name.to_os_string(),
                    kind: v.kind,
                })
            })
            .collect())
    }

    fn symlink(&self, path: &Path, target: &Path) -> io::Result<ItemAttr> {
        let mut item = MemItem::new(FileType::Symlink, 0o777);
        item.data = target.as_os_str().as_bytes().to_vec();
        self.insert_new(path, item)
    }

    fn readlink(&self, path: &Path) -> io::Result<Vec<u8>> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if item.kind != FileType::Symlink {
            return Err(os_err(libc::EINVAL));
        }
        Ok(item.data.clone())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        item.mode = mode;
        item.ctime = SystemTime::now();
        Ok(())
    }

    fn set_times(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if let Some(atime) = atime {
            item.atime = atime;
        }
        if let Some(mtime) = mtime {
            item.mtime = mtime;
        }
        Ok(())
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        item.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| os_err(libc::ENODATA))
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8]) -> io::Result<()> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        item.xattrs.insert(name.to_os_string(), value.to_vec());
        Ok(())
    }

    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        Ok(item.xattrs.keys().cloned().collect())
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        let mut items = self.items.lock();
        let item = items.get_mut(path).ok_or_else(|| os_err(libc::ENOENT))?;
        match item.xattrs.remove(name) {
            Some(_) => Ok(()),
            None => Err(os_err(libc::ENODATA)),
        }
    }

    fn subtree_size(&self, path: &Path) -> io::Result<u64> {
        let items = self.items.lock();
        let item = items.get(path).ok_or_else(|| os_err(libc::ENOENT))?;
        if item.kind != FileType::Directory {
            return Ok(item.data.len() as u64);
        }
        Ok(items
            .iter()
            .filter(|(k, v)| {
                v.kind != FileType::Directory && (k.starts_with(path) || path.as_os_str().is_empty())
            })
            .map(|(_, v)| v.data.len() as u64)
            .sum())
    }

    fn totals(&self) -> FsTotals {
        let items = self.items.lock();
        let used: u64 = items.values().map(|i| i.data.len() as u64).sum();
        FsTotals {
            blocks: 1 << 20,
            bfree: (1u64 << 20).saturating_sub(used / 512),
            files: items.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let b = MemBacking::new();
        b.create(Path::new("f.txt"), 0o644).unwrap();
        b.write(Path::new("f.txt"), 0, b"hello").unwrap();
        assert_eq!(b.read(Path::new("f.txt"), 0, 16).unwrap(), b"hello");
        assert_eq!(b.read(Path::new("f.txt"), 2, 2).unwrap(), b"ll");
        assert_eq!(b.getattr(Path::new("f.txt")).unwrap().size, 5);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let b = MemBacking::new();
        b.create(Path::new("f"), 0o644).unwrap();
        b.write(Path::new("f"), 4, b"x").unwrap();
        assert_eq!(b.read(Path::new("f"), 0, 8).unwrap(), b"\0\0\0\0x");
    }

    #[test]
    fn rename_moves_subtrees() {
        let b = MemBacking::new();
        b.mkdir(Path::new("a"), 0o755).unwrap();
        b.mkdir(Path::new("b"), 0o755).unwrap();
        b.create(Path::new("a/f"), 0o644).unwrap();
        b.write(Path::new("a/f"), 0, b"data").unwrap();
        b.rename(Path::new("a"), Path::new("b/c")).unwrap();
        assert_eq!(b.read(Path::new("b/c/f"), 0, 16).unwrap(), b"data");
        assert!(b.getattr(Path::new("a")).is_err());
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let b = MemBacking::new();
        b.mkdir(Path::new("d"), 0o755).unwrap();
        b.create(Path::new("d/f"), 0o644).unwrap();
        let err = b.rmdir(Path::new("d")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
        b.unlink(Path::new("d/f")).unwrap();
        b.rmdir(Path::new("d")).unwrap();
    }

    #[test]
    fn subtree_size_sums_files() {
        let b = MemBacking::new();
        b.mkdir(Path::new("d"), 0o755).unwrap();
        b.mkdir(Path::new("d/e"), 0o755).unwrap();
        b.create(Path::new("d/f"), 0o644).unwrap();
        b.create(Path::new("d/e/g"), 0o644).unwrap();
        b.write(Path::new("d/f"), 0, &[0u8; 100]).unwrap();
        b.write(Path::new("d/e/g"), 0, &[0u8; 50]).unwrap();
        assert_eq!(b.subtree_size(Path::new("d")).unwrap(), 150);
        assert_eq!(b.subtree_size(Path::new("d/f")).unwrap(), 100);
        assert_eq!(b.subtree_size(Path::new("")).unwrap(), 150);
    }

    #[test]
    fn xattrs_roundtrip() {
        let b = MemBacking::new();
        b.create(Path::new("f"), 0o644).unwrap();
        b.setxattr(Path::new("f"), OsStr::new("user.k"), b"v").unwrap();
        assert_eq!(b.getxattr(Path::new("f"), OsStr::new("user.k")).unwrap(), b"v");
        assert_eq!(b.listxattr(Path::new("f")).unwrap(), vec![OsString::from("user.k")]);
        b.removexattr(Path::new("f"), OsStr::new("user.k")).unwrap();
        let err = b.removexattr(Path::new("f"), OsStr::new("user.k")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    }
}
