//! Node table: the live mirror of the mounted tree.
//!
//! One entry per inode the kernel has looked up. Structure (parent edges,
//! child name maps) lives under a single table lock; effect lists and
//! counters hang off `Node` with their own locks so operations on distinct
//! nodes never contend. Lock order is table -> node -> effect.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use libc::c_int;
use parking_lot::Mutex;
use serde::Serialize;

use crate::effect::{Effect, EffectKind};
use crate::fatal_invariant;

/// Inode number of the mount root. Matches the FUSE root id.
pub const ROOT_INO: u64 = 1;

/// Cumulative per-node operation counters.
#[derive(Default)]
pub struct Counters {
    reads: AtomicU64,
    read_volume: AtomicU64,
    writes: AtomicU64,
    write_volume: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub reads: u64,
    pub read_volume: u64,
    pub writes: u64,
    pub write_volume: u64,
    pub errors: u64,
}

impl Counters {
    pub fn record_read(&self, volume: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_volume.fetch_add(volume, Ordering::Relaxed);
    }

    pub fn record_write(&self, volume: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_volume.fetch_add(volume, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.read_volume.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.write_volume.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_volume: self.read_volume.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_volume: self.write_volume.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A tracked inode. Owns its effects and counters; tree structure is kept in
/// the table so renames stay atomic with path resolution.
pub struct Node {
    ino: u64,
    effects: Mutex<Vec<Arc<Effect>>>,
    pub counters: Counters,
    lookups: AtomicU64,
    open_handles: AtomicU64,
    unlinked: AtomicBool,
}

impl Node {
    fn new(ino: u64) -> Node {
        Node {
            ino,
            effects: Mutex::new(Vec::new()),
            counters: Counters::default(),
            lookups: AtomicU64::new(0),
            open_handles: AtomicU64::new(0),
            unlinked: AtomicBool::new(false),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attach an effect, replacing any existing one with the same
    /// `(kind, suffix)` identity.
    pub fn attach(&self, effect: Effect) {
        let mut effects = self.effects.lock();
        effects.retain(|e| !(e.kind() == effect.kind() && e.suffix() == effect.suffix()));
        effects.push(Arc::new(effect));
    }

    /// Remove the effect named by `(kind, suffix)`. Returns false if absent.
    pub fn detach(&self, kind: EffectKind, suffix: &str) -> bool {
        let mut effects = self.effects.lock();
        let before = effects.len();
        effects.retain(|e| !(e.kind() == kind && e.suffix() == suffix));
        effects.len() != before
    }

    pub fn clear_effects(&self) {
        self.effects.lock().clear();
    }

    pub fn find_effect(&self, kind: EffectKind, suffix: &str) -> Option<Arc<Effect>> {
        self.effects
            .lock()
            .iter()
            .find(|e| e.kind() == kind && e.suffix() == suffix)
            .cloned()
    }

    /// Own effects in attachment order.
    pub fn effects(&self) -> Vec<Arc<Effect>> {
        self.effects.lock().clone()
    }
}

struct NodeSlot {
    node: Arc<Node>,
    parent: u64,
    name: OsString,
    children: HashMap<OsString, u64>,
}

struct TableInner {
    slots: HashMap<u64, NodeSlot>,
    next_ino: u64,
}

/// The inode table. A single lock guards structural changes; see module
/// docs for the lock order.
pub struct NodeTable {
    inner: Mutex<TableInner>,
    next_effect_seq: AtomicU64,
}

impl NodeTable {
    pub fn new() -> NodeTable {
        let mut slots = HashMap::new();
        slots.insert(
            ROOT_INO,
            NodeSlot {
                node: Arc::new(Node::new(ROOT_INO)),
                parent: ROOT_INO,
                name: OsString::new(),
                children: HashMap::new(),
            },
        );
        NodeTable {
            inner: Mutex::new(TableInner {
                slots,
                next_ino: ROOT_INO + 1,
            }),
            next_effect_seq: AtomicU64::new(0),
        }
    }

    /// Monotonic attachment-order counter for effects.
    pub fn next_effect_seq(&self) -> u64 {
        self.next_effect_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.inner.lock().slots.get(&ino).map(|s| s.node.clone())
    }

    pub fn child(&self, parent: u64, name: &OsStr) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(&parent)?;
        let ino = slot.children.get(name)?;
        inner.slots.get(ino).map(|s| s.node.clone())
    }

    /// Look up or lazily create the node for `parent/name`.
    pub fn ensure_child(&self, parent: u64, name: &OsStr) -> Result<Arc<Node>, c_int> {
        let mut inner = self.inner.lock();
        if !inner.slots.contains_key(&parent) {
            return Err(libc::ENOENT);
        }
        if let Some(ino) = inner.slots[&parent].children.get(name).copied() {
            match inner.slots.get(&ino) {
                Some(slot) => return Ok(slot.node.clone()),
                None => fatal_invariant("child edge points at a missing node slot"),
            }
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        let node = Arc::new(Node::new(ino));
        inner.slots.insert(
            ino,
            NodeSlot {
                node: node.clone(),
                parent,
                name: name.to_os_string(),
                children: HashMap::new(),
            },
        );
        if let Some(parent_slot) = inner.slots.get_mut(&parent) {
            parent_slot.children.insert(name.to_os_string(), ino);
        }
        Ok(node)
    }

    /// Backing path of `ino`, relative to the mount root ("" for the root).
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        let inner = self.inner.lock();
        let mut components: Vec<OsString> = Vec::new();
        let mut cursor = ino;
        while cursor != ROOT_INO {
            let slot = inner.slots.get(&cursor)?;
            components.push(slot.name.clone());
            if slot.parent == cursor {
                fatal_invariant("non-root node is its own parent");
            }
            cursor = slot.parent;
        }
        inner.slots.get(&ROOT_INO)?;
        let mut path = PathBuf::new();
        for part in components.iter().rev() {
            path.push(part);
        }
        Some(path)
    }

    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        self.inner.lock().slots.get(&ino).map(|s| s.parent)
    }

    /// Ancestor chain of `ino`, root first, `ino`'s node last.
    pub fn chain(&self, ino: u64) -> Option<Vec<Arc<Node>>> {
        let inner = self.inner.lock();
        let mut chain: Vec<Arc<Node>> = Vec::new();
        let mut cursor = ino;
        loop {
            let slot = inner.slots.get(&cursor)?;
            chain.push(slot.node.clone());
            if cursor == ROOT_INO {
                break;
            }
            if slot.parent == cursor {
                fatal_invariant("non-root node is its own parent");
            }
            cursor = slot.parent;
        }
        chain.reverse();
        Some(chain)
    }

    /// Detach `parent/name` after a successful backing unlink/rmdir. The
    /// node stays alive until the kernel forgets it and all handles close.
    pub fn remove_child(&self, parent: u64, name: &OsStr) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        let ino = inner.slots.get_mut(&parent)?.children.remove(name)?;
        let Some(node) = inner.slots.get(&ino).map(|s| s.node.clone()) else {
            fatal_invariant("child edge points at a missing node slot");
        };
        node.unlinked.store(true, Ordering::SeqCst);
        Self::maybe_collect(&mut inner, ino);
        Some(node)
    }

    /// Move the `parent/name` edge to `newparent/newname`, atomically with
    /// path resolution. An overwritten target is detached like an unlink.
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<(), c_int> {
        let mut inner = self.inner.lock();
        if !inner.slots.contains_key(&newparent) {
            return Err(libc::ENOENT);
        }
        let ino = inner
            .slots
            .get_mut(&parent)
            .and_then(|slot| slot.children.remove(name))
            .ok_or(libc::ENOENT)?;
        if let Some(displaced) = inner
            .slots
            .get_mut(&newparent)
            .and_then(|slot| slot.children.insert(newname.to_os_string(), ino))
        {
            if let Some(slot) = inner.slots.get(&displaced) {
                slot.node.unlinked.store(true, Ordering::SeqCst);
            }
            Self::maybe_collect(&mut inner, displaced);
        }
        match inner.slots.get_mut(&ino) {
            Some(slot) => {
                slot.parent = newparent;
                slot.name = newname.to_os_string();
            }
            None => fatal_invariant("renamed edge points at a missing node slot"),
        }
        Ok(())
    }

    pub fn inc_lookup(&self, ino: u64) {
        if let Some(node) = self.get(ino) {
            node.lookups.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get(&ino) {
            let node = slot.node.clone();
            let mut current = node.lookups.load(Ordering::SeqCst);
            loop {
                let next = current.saturating_sub(nlookup);
                match node.lookups.compare_exchange(
                    current,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        Self::maybe_collect(&mut inner, ino);
    }

    pub fn open(&self, ino: u64) {
        if let Some(node) = self.get(ino) {
            node.open_handles.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn release(&self, ino: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get(&ino) {
            let handles = &slot.node.open_handles;
            let mut current = handles.load(Ordering::SeqCst);
            while current > 0 {
                match handles.compare_exchange(
                    current,
                    current - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        Self::maybe_collect(&mut inner, ino);
    }

    /// Collect an orphan once it is unlinked, forgotten, and closed.
    /// Effects and counters die with the node.
    fn maybe_collect(inner: &mut TableInner, ino: u64) {
        let Some(slot) = inner.slots.get(&ino) else {
            return;
        };
        let node = &slot.node;
        if node.unlinked.load(Ordering::SeqCst)
            && node.lookups.load(Ordering::SeqCst) == 0
            && node.open_handles.load(Ordering::SeqCst) == 0
            && slot.children.is_empty()
        {
            inner.slots.remove(&ino);
        }
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
