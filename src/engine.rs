//! The operation interceptor.
//!
//! Every inbound filesystem operation flows through [`Engine`]: it gathers
//! the effective effect set by walking ancestors, runs pre effects (delay
//! accumulation, failure short-circuit, byte/volume reservations), performs
//! the backing call, settles reservations, runs post effects, and updates
//! the node's counters last.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libc::c_int;
use log::debug;

use crate::backing::{Backing, BackingDirEntry, FsTotals, ItemAttr, errno_of};
use crate::clock::{CancelToken, Clock, SharedRng};
use crate::control::{ControlName, ControlPlane};
use crate::effect::{Action, Effect, EffectBody, OpClass};
use crate::node::{Node, NodeTable};

/// The operation tuple effects are evaluated against.
#[derive(Debug, Clone, Copy)]
struct DataOp {
    class: OpClass,
    offset: u64,
    len: u64,
}

/// One effect in scope for an operation, with its MaxSize byte deltas.
struct Gathered {
    effect: Arc<Effect>,
    node_ino: u64,
    /// Bytes this op would add to the effect's subtree (checked + reserved).
    reserve: u64,
    /// Bytes the op itself displaces from the subtree, netted against
    /// `reserve` in the same limit check (a rename overwriting a target).
    credit: u64,
    /// Bytes this op removes from the subtree (credited on success).
    release: u64,
}

enum Rollback {
    MaxSize(Arc<Effect>, u64, u64),
    Quota(Arc<Effect>, u64),
}

pub struct Engine {
    table: Arc<NodeTable>,
    backing: Arc<dyn Backing>,
    clock: Arc<dyn Clock>,
    rng: Arc<SharedRng>,
    control: ControlPlane,
}

impl Engine {
    pub fn new(backing: Arc<dyn Backing>, clock: Arc<dyn Clock>, rng: Arc<SharedRng>) -> Engine {
        let table = Arc::new(NodeTable::new());
        let control = ControlPlane::new(table.clone(), clock.clone());
        Engine {
            table,
            backing,
            clock,
            rng,
            control,
        }
    }

    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.table.path_of(ino).ok_or(libc::ENOENT)
    }

    fn node_of(&self, ino: u64) -> Result<Arc<Node>, c_int> {
        self.table.get(ino).ok_or(libc::ENOENT)
    }

    /// Flatten a root-first ancestor chain into evaluation order, assigning
    /// MaxSize deltas. Per-node attachment order is preserved, which gives
    /// the (ancestor-distance desc, attachment asc) composition order.
    fn gather(chain: &[Arc<Node>], grow: u64, release: u64) -> Vec<Gathered> {
        let mut gathered = Vec::new();
        for node in chain {
            for effect in node.effects() {
                let is_max_size = matches!(effect.body(), EffectBody::MaxSize(_));
                gathered.push(Gathered {
                    effect,
                    node_ino: node.ino(),
                    reserve: if is_max_size { grow } else { 0 },
                    credit: 0,
                    release: if is_max_size { release } else { 0 },
                });
            }
        }
        gathered
    }

    /// The pre/backing/post pipeline shared by every classified operation.
    fn run_op<T>(
        &self,
        op_node: &Arc<Node>,
        gathered: &[Gathered],
        op: DataOp,
        cancel: &CancelToken,
        backing_call: impl FnOnce() -> Result<(T, u64), c_int>,
    ) -> Result<T, c_int> {
        let mut pending_delay = Duration::ZERO;
        let mut failure: Option<c_int> = None;
        let mut rollbacks: Vec<Rollback> = Vec::new();

        for g in gathered {
            match g.effect.body() {
                EffectBody::Delay(_) | EffectBody::Flakey(_) => {
                    match g.effect.evaluate_pre(op.class, self.clock.now_ms(), &self.rng) {
                        Action::Continue => {}
                        Action::Delay(dur) => pending_delay += dur,
                        Action::Fail(errno) => {
                            failure = Some(errno);
                            break;
                        }
                    }
                }
                EffectBody::MaxSize(max_size) => {
                    if op.class == OpClass::Write && (g.reserve > 0 || g.credit > 0) {
                        if !max_size.is_initialized() {
                            // Recompute from the backing store without the
                            // effect lock held.
                            match self
                                .path_of(g.node_ino)
                                .and_then(|p| self.backing.subtree_size(&p).map_err(|e| errno_of(&e)))
                            {
                                Ok(bytes) => max_size.initialize(bytes),
                                Err(errno) => {
                                    failure = Some(errno);
                                    break;
                                }
                            }
                        }
                        match max_size.try_reserve_net(g.reserve, g.credit) {
                            Ok(()) => {
                                rollbacks.push(Rollback::MaxSize(
                                    g.effect.clone(),
                                    g.reserve,
                                    g.credit,
                                ));
                            }
                            Err(errno) => {
                                failure = Some(errno);
                                break;
                            }
                        }
                    }
                }
                EffectBody::Quota(quota) => {
                    let rounded = quota.rounded(op.len);
                    if rounded > 0 {
                        match quota.try_reserve(rounded) {
                            Ok(()) => rollbacks.push(Rollback::Quota(g.effect.clone(), rounded)),
                            Err(errno) => {
                                failure = Some(errno);
                                break;
                            }
                        }
                    }
                }
                EffectBody::Heatmap(_) => {}
            }
        }

        // Delays accumulated before any short-circuit are slept in one go.
        if pending_delay > Duration::ZERO
            && self.clock.sleep(pending_delay, cancel).is_err()
        {
            failure = Some(libc::EINTR);
        }

        let result: Result<(T, u64), c_int> = match failure {
            Some(errno) => Err(errno),
            None => backing_call(),
        };

        match &result {
            Ok(_) => {
                for g in gathered {
                    if g.release > 0 {
                        if let EffectBody::MaxSize(max_size) = g.effect.body() {
                            max_size.release(g.release);
                        }
                    }
                }
            }
            Err(_) => {
                for rollback in rollbacks {
                    match rollback {
                        Rollback::MaxSize(effect, grow, credit) => {
                            if let EffectBody::MaxSize(max_size) = effect.body() {
                                max_size.unreserve_net(grow, credit);
                            }
                        }
                        Rollback::Quota(effect, amount) => {
                            if let EffectBody::Quota(quota) = effect.body() {
                                quota.unreserve(amount);
                            }
                        }
                    }
                }
            }
        }

        // Post effects observe the attempt whether or not it succeeded.
        for g in gathered {
            if let EffectBody::Heatmap(heatmap) = g.effect.body() {
                heatmap.record(op.class, op.offset, op.len);
            }
        }

        match result {
            Ok((value, volume)) => {
                match op.class {
                    OpClass::Read => op_node.counters.record_read(volume),
                    OpClass::Write => op_node.counters.record_write(volume),
                }
                Ok(value)
            }
            Err(errno) => {
                op_node.counters.record_error();
                Err(errno)
            }
        }
    }

    // ---- namespace ops -------------------------------------------------

    /// Resolve `parent/name`, lazily creating the node table entry and
    /// taking one kernel lookup reference.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<(u64, ItemAttr), c_int> {
        let path = self.path_of(parent)?.join(name);
        let attr = self.backing.getattr(&path).map_err(|e| errno_of(&e))?;
        let node = self.table.ensure_child(parent, name)?;
        self.table.inc_lookup(node.ino());
        Ok((node.ino(), attr))
    }

    /// Metadata read: counted as an `r` op but never runs effects.
    pub fn getattr(&self, ino: u64) -> Result<ItemAttr, c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        match self.backing.getattr(&path) {
            Ok(attr) => {
                node.counters.record_read(0);
                Ok(attr)
            }
            Err(e) => {
                node.counters.record_error();
                Err(errno_of(&e))
            }
        }
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        match self.backing.readlink(&path) {
            Ok(target) => {
                node.counters.record_read(0);
                Ok(target)
            }
            Err(e) => {
                node.counters.record_error();
                Err(errno_of(&e))
            }
        }
    }

    // ---- data ops ------------------------------------------------------

    pub fn read(
        &self,
        ino: u64,
        offset: u64,
        size: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        let chain = self.table.chain(ino).ok_or(libc::ENOENT)?;
        let gathered = Self::gather(&chain, 0, 0);
        let op = DataOp {
            class: OpClass::Read,
            offset,
            len: u64::from(size),
        };
        self.run_op(&node, &gathered, op, cancel, || {
            self.backing
                .read(&path, offset, size)
                .map(|data| {
                    let volume = data.len() as u64;
                    (data, volume)
                })
                .map_err(|e| errno_of(&e))
        })
    }

    pub fn write(
        &self,
        ino: u64,
        offset: u64,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<u32, c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        let chain = self.table.chain(ino).ok_or(libc::ENOENT)?;
        let len = data.len() as u64;
        let current = self
            .backing
            .getattr(&path)
            .map(|attr| attr.size)
            .unwrap_or(0);
        let grow = (offset + len).saturating_sub(current);
        let gathered = Self::gather(&chain, grow, 0);
        let op = DataOp {
            class: OpClass::Write,
            offset,
            len,
        };
        self.run_op(&node, &gathered, op, cancel, || {
            self.backing
                .write(&path, offset, data)
                .map(|written| (written, u64::from(written)))
                .map_err(|e| errno_of(&e))
        })
    }

    pub fn truncate(&self, ino: u64, size: u64, cancel: &CancelToken) -> Result<(), c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        let chain = self.table.chain(ino).ok_or(libc::ENOENT)?;
        let current = self
            .backing
            .getattr(&path)
            .map(|attr| attr.size)
            .unwrap_or(0);
        let grow = size.saturating_sub(current);
        let release = current.saturating_sub(size);
        let gathered = Self::gather(&chain, grow, release);
        let op = DataOp {
            class: OpClass::Write,
            offset: 0,
            len: 0,
        };
        self.run_op(&node, &gathered, op, cancel, || {
            self.backing
                .truncate(&path, size)
                .map(|()| ((), 0))
                .map_err(|e| errno_of(&e))
        })
    }

    pub fn readdir(&self, ino: u64, cancel: &CancelToken) -> Result<Vec<BackingDirEntry>, c_int> {
        let node = self.node_of(ino)?;
        let path = self.path_of(ino)?;
        let chain = self.table.chain(ino).ok_or(libc::ENOENT)?;
        let gathered = Self::gather(&chain, 0, 0);
        let op = DataOp {
            class: OpClass::Read,
            offset: 0,
            len: 0,
        };
        self.run_op(&node, &gathered, op, cancel, || {
            self.backing
                .readdir(&path)
                .map(|entries| (entries, 0))
                .map_err(|e| errno_of(&e))
        })
    }

    pub fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        cancel: &CancelToken,
    ) -> Result<(u64, ItemAttr), c_int> {
        self.create_entry(parent, name, cancel, |path| self.backing.create(path, mode))
    }

    pub fn mkdir(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        cancel: &CancelToken,
    ) -> Result<(u64, ItemAttr), c_int> {
        self.create_entry(parent, name, cancel, |path| self.backing.mkdir(path, mode))
    }

    pub fn symlink(
        &self,
        parent: u64,
        name: &OsStr,
        target: &Path,
        cancel: &CancelToken,
    ) -> Result<(u64, ItemAttr), c_int> {
        self.create_entry(parent, name, cancel, |path| self.backing.symlink(path, target))
    }

    /// Shared shape of create/mkdir/symlink: a `w` op on the parent.
    fn create_entry(
        &self,
        parent: u64,
        name: &OsStr,
        cancel: &CancelToken,
        backing_call: impl FnOnce(&Path) -> std::io::Result<ItemAttr>,
    ) -> Result<(u64, ItemAttr), c_int> {
        let parent_node = self.node_of(parent)?;
        let path = self.path_of(parent)?.join(name);
        let chain = self.table.chain(parent).ok_or(libc::ENOENT)?;
        let gathered = Self::gather(&chain, 0, 0);
        let op = DataOp {
            class: OpClass::Write,
            offset: 0,
            len: 0,
        };
        let attr = self.run_op(&parent_node, &gathered, op, cancel, || {
            backing_call(&path).map(|attr| (attr, 0)).map_err(|e| errno_of(&e))
        })?;
        let node = self.table.ensure_child(parent, name)?;
        self.table.inc_lookup(node.ino());
        Ok((node.ino(), attr))
    }

    pub fn unlink(&self, parent: u64, name: &OsStr, cancel: &CancelToken) -> Result<(), c_int> {
        self.remove_entry(parent, name, cancel, false)
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr, cancel: &CancelToken) -> Result<(), c_int> {
        self.remove_entry(parent, name, cancel, true)
    }

    /// Unlink/rmdir: a `w` op on the child; its bytes leave every MaxSize
    /// subtree above it on success.
    fn remove_entry(
        &self,
        parent: u64,
        name: &OsStr,
        cancel: &CancelToken,
        is_dir: bool,
    ) -> Result<(), c_int> {
        let path = self.path_of(parent)?.join(name);
        let attr = match self.backing.getattr(&path) {
            Ok(attr) => attr,
            Err(e) => {
                if let Some(parent_node) = self.table.get(parent) {
                    parent_node.counters.record_error();
                }
                return Err(errno_of(&e));
            }
        };
        let bytes = if attr.kind == fuser::FileType::Directory {
            0 // only empty directories can go
        } else {
            attr.size
        };
        let child = self.table.ensure_child(parent, name)?;
        let chain = self.table.chain(child.ino()).ok_or(libc::ENOENT)?;
        let gathered = Self::gather(&chain, 0, bytes);
        let op = DataOp {
            class: OpClass::Write,
            offset: 0,
            len: 0,
        };
        self.run_op(&child, &gathered, op, cancel, || {
            let call = if is_dir {
                self.backing.rmdir(&path)
            } else {
                self.backing.unlink(&path)
            };
            call.map(|()| ((), 0)).map_err(|e| errno_of(&e))
        })?;
        self.table.remove_child(parent, name);
        Ok(())
    }

    /// Rename is a `w` op on the renamed node, evaluated against the union
    /// of the source and destination ancestor chains. For MaxSize
    /// accounting it behaves as detach + attach: destination-only effects
    /// check and apply the net delta (moved bytes in, overwritten-target
    /// bytes out) in one step, source-only effects release the moved bytes
    /// on success, and effects shared by both chains release only the
    /// overwritten target's bytes on success.
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        cancel: &CancelToken,
    ) -> Result<(), c_int> {
        let src_path = self.path_of(parent)?.join(name);
        let dst_path = self.path_of(newparent)?.join(newname);
        let attr = match self.backing.getattr(&src_path) {
            Ok(attr) => attr,
            Err(e) => {
                if let Some(parent_node) = self.table.get(parent) {
                    parent_node.counters.record_error();
                }
                return Err(errno_of(&e));
            }
        };
        let is_dir = attr.kind == fuser::FileType::Directory;
        let moved = if is_dir {
            self.backing
                .subtree_size(&src_path)
                .map_err(|e| errno_of(&e))?
        } else {
            attr.size
        };
        let displaced = self
            .backing
            .getattr(&dst_path)
            .map(|a| if a.kind == fuser::FileType::Directory { 0 } else { a.size })
            .unwrap_or(0);

        let node = self.table.ensure_child(parent, name)?;
        let src_chain = self.table.chain(node.ino()).ok_or(libc::ENOENT)?;
        let dst_chain = self.table.chain(newparent).ok_or(libc::ENOENT)?;

        let in_dst: Vec<*const Effect> = dst_chain
            .iter()
            .flat_map(|n| n.effects())
            .map(|e| Arc::as_ptr(&e))
            .collect();
        let in_src: Vec<*const Effect> = src_chain
            .iter()
            .flat_map(|n| n.effects())
            .map(|e| Arc::as_ptr(&e))
            .collect();

        let mut gathered = Vec::new();
        for n in &src_chain {
            for effect in n.effects() {
                let ptr = Arc::as_ptr(&effect);
                let shared = in_dst.contains(&ptr);
                let (reserve, credit, release) = match effect.body() {
                    // Effects on the renamed node itself travel with it;
                    // their subtree contents are unchanged by the move.
                    EffectBody::MaxSize(_) if n.ino() != node.ino() => {
                        let out = if shared { 0 } else { moved };
                        let back = if shared { displaced } else { 0 };
                        (0, 0, out + back)
                    }
                    _ => (0, 0, 0),
                };
                gathered.push(Gathered {
                    effect,
                    node_ino: n.ino(),
                    reserve,
                    credit,
                    release,
                });
            }
        }
        for n in &dst_chain {
            for effect in n.effects() {
                let ptr = Arc::as_ptr(&effect);
                if in_src.contains(&ptr) {
                    continue; // already gathered via the source chain
                }
                let (reserve, credit, release) = match effect.body() {
                    // The displaced target's bytes leave this subtree as
                    // part of the same op, so they net against the check
                    // rather than blocking it.
                    EffectBody::MaxSize(_) => (moved, displaced, 0),
                    _ => (0, 0, 0),
                };
                gathered.push(Gathered {
                    effect,
                    node_ino: n.ino(),
                    reserve,
                    credit,
                    release,
                });
            }
        }

        let op = DataOp {
            class: OpClass::Write,
            offset: 0,
            len: 0,
        };
        self.run_op(&node, &gathered, op, cancel, || {
            self.backing
                .rename(&src_path, &dst_path)
                .map(|()| ((), 0))
                .map_err(|e| errno_of(&e))
        })?;
        self.table.rename(parent, name, newparent, newname)?;
        Ok(())
    }

    // ---- metadata passthrough -----------------------------------------

    pub fn set_mode(&self, ino: u64, mode: u32) -> Result<(), c_int> {
        let path = self.path_of(ino)?;
        self.backing.set_mode(&path, mode).map_err(|e| errno_of(&e))
    }

    pub fn set_times(
        &self,
        ino: u64,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> Result<(), c_int> {
        let path = self.path_of(ino)?;
        self.backing
            .set_times(&path, atime, mtime)
            .map_err(|e| errno_of(&e))
    }

    pub fn totals(&self) -> FsTotals {
        self.backing.totals()
    }

    // ---- xattr dispatch ------------------------------------------------

    /// `bf.*` names go to the control plane and never trigger effects; the
    /// rest pass through so host xattrs coexist with ours.
    pub fn xattr_set(&self, ino: u64, name: &OsStr, value: &[u8]) -> Result<(), c_int> {
        match ControlName::parse(name) {
            Some(control_name) => self
                .control
                .set(ino, &control_name, value)
                .map_err(|e| e.errno()),
            None => {
                let path = self.path_of(ino)?;
                self.backing
                    .setxattr(&path, name, value)
                    .map_err(|e| errno_of(&e))
            }
        }
    }

    pub fn xattr_get(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>, c_int> {
        match ControlName::parse(name) {
            Some(control_name) => self
                .control
                .get(ino, &control_name)
                .map_err(|e| e.errno()),
            None => {
                let path = self.path_of(ino)?;
                self.backing
                    .getxattr(&path, name)
                    .map_err(|e| errno_of(&e))
            }
        }
    }

    pub fn xattr_remove(&self, ino: u64, name: &OsStr) -> Result<(), c_int> {
        match ControlName::parse(name) {
            Some(control_name) => self
                .control
                .remove(ino, &control_name)
                .map_err(|e| e.errno()),
            None => {
                let path = self.path_of(ino)?;
                self.backing
                    .removexattr(&path, name)
                    .map_err(|e| errno_of(&e))
            }
        }
    }

    /// Backing names plus our control-plane names, null-separated by fs.rs.
    pub fn xattr_list(&self, ino: u64) -> Result<Vec<Vec<u8>>, c_int> {
        let path = self.path_of(ino)?;
        let mut names: Vec<Vec<u8>> = match self.backing.listxattr(&path) {
            Ok(list) => list
                .into_iter()
                .map(|n| n.as_encoded_bytes().to_vec())
                .collect(),
            Err(e) => return Err(errno_of(&e)),
        };
        names.extend(self.control.list_names(ino));
        Ok(names)
    }

    // ---- lifecycle hooks (forwarded by fs.rs) --------------------------

    pub fn open(&self, ino: u64) -> Result<(), c_int> {
        self.node_of(ino)?;
        self.table.open(ino);
        Ok(())
    }

    pub fn release(&self, ino: u64) {
        self.table.release(ino);
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        debug!("forget(ino: {ino}, nlookup: {nlookup})");
        self.table.forget(ino, nlookup);
    }
}
