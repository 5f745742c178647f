//! The FUSE-facing adapter.
//!
//! `BrokenFs` translates `fuser::Filesystem` callbacks into engine calls.
//! Classified (r/w) operations are served from worker threads so a sleeping
//! Delay never stalls an unrelated request on the kernel channel; metadata
//! ops reply inline. No effect logic lives here.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, error, warn};

use crate::backing::ItemAttr;
use crate::clock::CancelToken;
use crate::engine::Engine;

const TTL: Duration = Duration::ZERO;
const BLOCK_SIZE: u32 = 512;
const MAX_NAME_LENGTH: u32 = 255;

struct FsInner {
    engine: Engine,
    shutdown: CancelToken,
    next_fh: AtomicU64,
}

/// The mounted filesystem handed to `fuser::mount2`.
pub struct BrokenFs {
    inner: Arc<FsInner>,
}

impl BrokenFs {
    pub fn new(engine: Engine) -> BrokenFs {
        BrokenFs {
            inner: Arc::new(FsInner {
                engine,
                shutdown: CancelToken::new(),
                next_fh: AtomicU64::new(1),
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn spawn(&self, name: &'static str, task: impl FnOnce() + Send + 'static) {
        if let Err(e) = thread::Builder::new()
            .name(format!("bf-{name}"))
            .spawn(task)
        {
            // The dropped reply surfaces as an error to the caller.
            error!("failed to spawn {name} worker: {e}");
        }
    }
}

fn file_attr(ino: u64, attr: &ItemAttr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: attr.kind,
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn time_of(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl fuser::Filesystem for BrokenFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        // Cut short any delay still sleeping in a worker.
        self.inner.shutdown.cancel();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if name.len() > MAX_NAME_LENGTH as usize {
            reply.error(libc::ENAMETOOLONG);
            return;
        }
        match self.inner.engine.lookup(parent, name) {
            Ok((ino, attr)) => reply.entry(&TTL, &file_attr(ino, &attr), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inner.engine.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.inner.engine.getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let inner = self.inner.clone();
        let apply = move || {
            if let Some(mode) = mode {
                if let Err(errno) = inner.engine.set_mode(ino, mode) {
                    reply.error(errno);
                    return;
                }
            }
            if let Some(size) = size {
                debug!("truncate() called with ino {ino} size {size}");
                if let Err(errno) = inner.engine.truncate(ino, size, &inner.shutdown) {
                    reply.error(errno);
                    return;
                }
            }
            if atime.is_some() || mtime.is_some() {
                if let Err(errno) =
                    inner
                        .engine
                        .set_times(ino, atime.map(time_of), mtime.map(time_of))
                {
                    reply.error(errno);
                    return;
                }
            }
            match inner.engine.getattr(ino) {
                Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
                Err(errno) => reply.error(errno),
            }
        };
        if size.is_some() {
            // Truncate is a classified write; serve it off-channel.
            self.spawn("setattr", apply);
        } else {
            apply();
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.inner.engine.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
            warn!("mknod() only supports regular files, got mode {mode:o}");
            reply.error(libc::EPERM);
            return;
        }
        let inner = self.inner.clone();
        let name = name.to_os_string();
        self.spawn("mknod", move || {
            match inner.engine.create(parent, &name, mode, &inner.shutdown) {
                Ok((ino, attr)) => reply.entry(&TTL, &file_attr(ino, &attr), 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let inner = self.inner.clone();
        let name = name.to_os_string();
        self.spawn("mkdir", move || {
            match inner.engine.mkdir(parent, &name, mode, &inner.shutdown) {
                Ok((ino, attr)) => reply.entry(&TTL, &file_attr(ino, &attr), 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let inner = self.inner.clone();
        let name = name.to_os_string();
        self.spawn("unlink", move || {
            match inner.engine.unlink(parent, &name, &inner.shutdown) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let inner = self.inner.clone();
        let name = name.to_os_string();
        self.spawn("rmdir", move || {
            match inner.engine.rmdir(parent, &name, &inner.shutdown) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let inner = self.inner.clone();
        let link_name = link_name.to_os_string();
        let target = target.to_path_buf();
        self.spawn("symlink", move || {
            match inner
                .engine
                .symlink(parent, &link_name, &target, &inner.shutdown)
            {
                Ok((ino, attr)) => reply.entry(&TTL, &file_attr(ino, &attr), 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_EXCHANGE / NOREPLACE are not supported.
            reply.error(libc::EINVAL);
            return;
        }
        let inner = self.inner.clone();
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.spawn("rename", move || {
            match inner
                .engine
                .rename(parent, &name, newparent, &newname, &inner.shutdown)
            {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.inner.engine.open(ino) {
            Ok(()) => {
                let fh = self.inner.next_fh.fetch_add(1, Ordering::SeqCst);
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let inner = self.inner.clone();
        let offset = offset.max(0) as u64;
        self.spawn("read", move || {
            match inner.engine.read(ino, offset, size, &inner.shutdown) {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let inner = self.inner.clone();
        let offset = offset.max(0) as u64;
        let data = data.to_vec();
        self.spawn("write", move || {
            match inner.engine.write(ino, offset, &data, &inner.shutdown) {
                Ok(written) => reply.written(written),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.inner.engine.release(ino);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.inner.engine.open(ino) {
            Ok(()) => {
                let fh = self.inner.next_fh.fetch_add(1, Ordering::SeqCst);
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let inner = self.inner.clone();
        self.spawn("readdir", move || {
            let entries = match inner.engine.readdir(ino, &inner.shutdown) {
                Ok(entries) => entries,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let parent = inner.engine.table().parent_of(ino).unwrap_or(ino);
            let mut listing: Vec<(u64, fuser::FileType, std::ffi::OsString)> = vec![
                (ino, fuser::FileType::Directory, ".".into()),
                (parent, fuser::FileType::Directory, "..".into()),
            ];
            for entry in entries {
                // Mirror listed entries into the node table so they answer
                // with the same inode a later lookup() will hand out.
                match inner.engine.table().ensure_child(ino, &entry.name) {
                    Ok(node) => listing.push((node.ino(), entry.kind, entry.name)),
                    Err(errno) => {
                        reply.error(errno);
                        return;
                    }
                }
            }
            for (index, (entry_ino, kind, name)) in
                listing.into_iter().enumerate().skip(offset.max(0) as usize)
            {
                if reply.add(entry_ino, (index + 1) as i64, kind, &name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.inner.engine.release(ino);
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let totals = self.inner.engine.totals();
        reply.statfs(
            totals.blocks,
            totals.bfree,
            totals.bfree,
            totals.files,
            totals.files,
            BLOCK_SIZE,
            MAX_NAME_LENGTH,
            BLOCK_SIZE,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.inner.engine.xattr_set(ino, name, value) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self.inner.engine.xattr_get(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.inner.engine.xattr_list(ino) {
            Ok(names) => {
                let mut bytes = Vec::new();
                for name in names {
                    bytes.extend(name);
                    bytes.push(0);
                }
                if size == 0 {
                    reply.size(bytes.len() as u32);
                } else if bytes.len() <= size as usize {
                    reply.data(&bytes);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.inner.engine.xattr_remove(ino, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permission checks are the backing store's business; the mount
        // uses default_permissions so the kernel enforces modes.
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let inner = self.inner.clone();
        let name = name.to_os_string();
        self.spawn("create", move || {
            match inner.engine.create(parent, &name, mode, &inner.shutdown) {
                Ok((ino, attr)) => {
                    inner.engine.table().open(ino);
                    let fh = inner.next_fh.fetch_add(1, Ordering::SeqCst);
                    reply.created(&TTL, &file_attr(ino, &attr), 0, fh, 0);
                }
                Err(errno) => reply.error(errno),
            }
        });
    }
}
