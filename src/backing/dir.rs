//! Host-directory backing adapter.
//!
//! Forwards every operation to the real filesystem under a configured root.
//! Anything std does not cover (xattrs, utimensat) goes through `libc`
//! directly.

use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::FileType;

use super::{Backing, BackingDirEntry, FsTotals, ItemAttr, os_err};

pub struct DirBacking {
    root: PathBuf,
}

impl DirBacking {
    /// The root must already exist and be a directory; the mount entry point
    /// verifies that before constructing the adapter.
    pub fn new(root: impl Into<PathBuf>) -> DirBacking {
        DirBacking { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn c_path(&self, path: &Path) -> io::Result<CString> {
        CString::new(self.full(path).into_os_string().into_vec())
            .map_err(|_| os_err(libc::EINVAL))
    }
}

fn file_type_of(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::RegularFile
    }
}

fn attr_of(meta: &fs::Metadata) -> ItemAttr {
    ItemAttr {
        kind: file_type_of(meta.file_type()),
        size: meta.size(),
        perm: (meta.permissions().mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
    }
}

fn timespec_of(time: Option<SystemTime>) -> libc::timespec {
    match time.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

fn walk_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.size());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += walk_size(&entry.path())?;
        } else {
            total += meta.size();
        }
    }
    Ok(total)
}

impl Backing for DirBacking {
    fn getattr(&self, path: &Path) -> io::Result<ItemAttr> {
        fs::symlink_metadata(self.full(path)).map(|m| attr_of(&m))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<ItemAttr> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.full(path))?;
        self.getattr(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<ItemAttr> {
        let full = self.full(path);
        fs::create_dir(&full)?;
        fs::set_permissions(&full, fs::Permissions::from_mode(mode))?;
        self.getattr(path)
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let file = File::open(self.full(path))?;
        let mut buffer = vec![0; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<u32> {
        let file = OpenOptions::new().write(true).open(self.full(path))?;
        file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.full(path))?;
        file.set_len(size)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.full(path))
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.full(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.full(from), self.full(to))
    }

    fn readdir(&self, path: &Path) -> io::Result<Vec<BackingDirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full(path))? {
            let entry = entry?;
            entries.push(BackingDirEntry {
                name: entry.file_name(),
                kind: file_type_of(entry.file_type()?),
            });
        }
        Ok(entries)
    }

    fn symlink(&self, path: &Path, target: &Path) -> io::Result<ItemAttr> {
        std::os::unix::fs::symlink(target, self.full(path))?;
        self.getattr(path)
    }

    fn readlink(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read_link(self.full(path)).map(|t| t.into_os_string().into_vec())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.full(path), fs::Permissions::from_mode(mode))
    }

    fn set_times(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        let c_path = self.c_path(path)?;
        let times = [timespec_of(atime), timespec_of(mtime)];
        let rc = unsafe {
            libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
        let c_path = self.c_path(path)?;
        let c_name =
            CString::new(name.as_bytes().to_vec()).map_err(|_| os_err(libc::EINVAL))?;
        let len = unsafe {
            libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buffer = vec![0u8; len as usize];
        let len = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        buffer.truncate(len as usize);
        Ok(buffer)
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8]) -> io::Result<()> {
        let c_path = self.c_path(path)?;
        let c_name =
            CString::new(name.as_bytes().to_vec()).map_err(|_| os_err(libc::EINVAL))?;
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn listxattr(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let c_path = self.c_path(path)?;
        let len = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buffer = vec![0u8; len as usize];
        let len = unsafe {
            libc::listxattr(c_path.as_ptr(), buffer.as_mut_ptr().cast(), buffer.len())
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        buffer.truncate(len as usize);
        Ok(buffer
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| OsStr::from_bytes(s).to_os_string())
            .collect())
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        let c_path = self.c_path(path)?;
        let c_name =
            CString::new(name.as_bytes().to_vec()).map_err(|_| os_err(libc::EINVAL))?;
        let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn subtree_size(&self, path: &Path) -> io::Result<u64> {
        walk_size(&self.full(path))
    }

    fn totals(&self) -> FsTotals {
        // Good enough for statfs over a testing mount.
        FsTotals {
            blocks: 1 << 20,
            bfree: 1 << 19,
            files: 1 << 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backing() -> (TempDir, DirBacking) {
        let dir = tempfile::tempdir().unwrap();
        let backing = DirBacking::new(dir.path());
        (dir, backing)
    }

    #[test]
    fn create_write_read() {
        let (_dir, b) = backing();
        b.create(Path::new("f.txt"), 0o644).unwrap();
        b.write(Path::new("f.txt"), 0, b"works\n").unwrap();
        assert_eq!(b.read(Path::new("f.txt"), 0, 64).unwrap(), b"works\n");
        let attr = b.getattr(Path::new("f.txt")).unwrap();
        assert_eq!(attr.size, 6);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn subtree_size_recurses() {
        let (_dir, b) = backing();
        b.mkdir(Path::new("d"), 0o755).unwrap();
        b.mkdir(Path::new("d/e"), 0o755).unwrap();
        b.create(Path::new("d/a"), 0o644).unwrap();
        b.create(Path::new("d/e/b"), 0o644).unwrap();
        b.write(Path::new("d/a"), 0, &[1u8; 300]).unwrap();
        b.write(Path::new("d/e/b"), 0, &[1u8; 200]).unwrap();
        assert_eq!(b.subtree_size(Path::new("d")).unwrap(), 500);
    }

    #[test]
    fn unlink_and_errors_carry_errno() {
        let (_dir, b) = backing();
        let err = b.unlink(Path::new("missing")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn readdir_lists_entries() {
        let (_dir, b) = backing();
        b.create(Path::new("x"), 0o644).unwrap();
        b.mkdir(Path::new("y"), 0o755).unwrap();
        let mut names: Vec<OsString> =
            b.readdir(Path::new("")).unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec![OsString::from("x"), OsString::from("y")]);
    }
}
