//! End-to-end scenarios against the engine over the in-memory backing.
//!
//! These mirror the shell-level walkthroughs from the README (delay a cat,
//! flake half the writes, cap a directory) but drive the library directly:
//! a manual clock makes the timing assertions exact and a fixed seed makes
//! the probabilistic ones reproducible.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use brokenfuse::Engine;
use brokenfuse::backing::MemBacking;
use brokenfuse::clock::{CancelToken, Clock, ManualClock, SharedRng};
use brokenfuse::node::ROOT_INO;

struct Rig {
    engine: Engine,
    clock: Arc<ManualClock>,
    cancel: CancelToken,
}

fn rig_with_seed(seed: u64) -> Rig {
    let clock = Arc::new(ManualClock::new(7_000_000));
    Rig {
        engine: Engine::new(
            Arc::new(MemBacking::new()),
            clock.clone(),
            Arc::new(SharedRng::seeded(seed)),
        ),
        clock,
        cancel: CancelToken::new(),
    }
}

fn rig() -> Rig {
    rig_with_seed(42)
}

impl Rig {
    fn create(&self, parent: u64, name: &str) -> u64 {
        self.engine
            .create(parent, OsStr::new(name), 0o644, &self.cancel)
            .unwrap()
            .0
    }

    fn mkdir(&self, parent: u64, name: &str) -> u64 {
        self.engine
            .mkdir(parent, OsStr::new(name), 0o755, &self.cancel)
            .unwrap()
            .0
    }

    fn attach(&self, ino: u64, name: &str, value: &str) {
        self.engine
            .xattr_set(ino, OsStr::new(name), value.as_bytes())
            .unwrap();
    }

    fn detach(&self, ino: u64, name: &str) {
        self.engine.xattr_remove(ino, OsStr::new(name)).unwrap();
    }
}

#[test]
fn s1_delay_reads_but_not_writes() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "t.txt");
    rig.engine.write(file, 0, b"works\n", &rig.cancel).unwrap();
    rig.attach(file, "bf.effect.delay", r#"{"duration_ms":1000,"op":"r"}"#);

    let data = rig.engine.read(file, 0, 4096, &rig.cancel).unwrap();
    assert_eq!(data, b"works\n");
    assert_eq!(rig.clock.total_slept(), Duration::from_millis(1000));

    rig.engine.write(file, 6, b"more\n", &rig.cancel).unwrap();
    assert_eq!(rig.clock.total_slept(), Duration::from_millis(1000));
}

#[test]
fn s2_probabilistic_flakey_is_seed_deterministic() {
    let outcomes = |seed: u64| -> Vec<bool> {
        let rig = rig_with_seed(seed);
        let file = rig.create(ROOT_INO, "t.txt");
        rig.attach(file, "bf.effect.flakey", r#"{"prob":0.5,"op":"w"}"#);
        (0..1000u64)
            .map(|i| rig.engine.write(file, i, &[b'x'], &rig.cancel).is_err())
            .collect()
    };

    let run = outcomes(42);
    let failures = run.iter().filter(|failed| **failed).count();
    assert!((400..=600).contains(&failures), "failures={failures}");
    // Same seed, same fault schedule, op by op.
    assert_eq!(run, outcomes(42));

    // Failures surface the default errno.
    let rig = rig_with_seed(42);
    let file = rig.create(ROOT_INO, "t.txt");
    rig.attach(file, "bf.effect.flakey", r#"{"prob":1.0,"op":"w"}"#);
    assert_eq!(
        rig.engine.write(file, 0, b"x", &rig.cancel),
        Err(libc::EIO)
    );
}

#[test]
fn s3_max_size_caps_a_directory() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "dir");
    rig.attach(dir, "bf.effect.maxsize", r#"{"limit":1024}"#);

    let a = rig.create(dir, "a");
    let b = rig.create(dir, "b");
    assert_eq!(rig.engine.write(a, 0, &[1u8; 512], &rig.cancel), Ok(512));
    assert_eq!(rig.engine.write(b, 0, &[2u8; 512], &rig.cancel), Ok(512));
    assert_eq!(
        rig.engine.write(a, 512, &[3u8; 1], &rig.cancel),
        Err(libc::ENOSPC)
    );

    rig.engine
        .unlink(dir, OsStr::new("b"), &rig.cancel)
        .unwrap();
    let c = rig.create(dir, "c");
    assert_eq!(rig.engine.write(c, 0, &[4u8; 512], &rig.cancel), Ok(512));
}

#[test]
fn rename_overwrite_nets_displaced_bytes_in_the_check() {
    let rig = rig();
    let a = rig.mkdir(ROOT_INO, "a");
    let b = rig.mkdir(ROOT_INO, "b");
    rig.attach(b, "bf.effect.maxsize", r#"{"limit":1000}"#);

    // Fill b to its limit: 500 bytes in the future overwrite target,
    // 500 elsewhere.
    let target = rig.create(b, "target");
    assert_eq!(rig.engine.write(target, 0, &[1u8; 500], &rig.cancel), Ok(500));
    let other = rig.create(b, "other");
    assert_eq!(rig.engine.write(other, 0, &[2u8; 500], &rig.cancel), Ok(500));

    let big = rig.create(a, "big");
    assert_eq!(rig.engine.write(big, 0, &[3u8; 600], &rig.cancel), Ok(600));

    // Overwriting the 500-byte target with 600 bytes nets to +100, which
    // still does not fit in the full subtree.
    assert_eq!(
        rig.engine.rename(a, OsStr::new("big"), b, OsStr::new("target"), &rig.cancel),
        Err(libc::ENOSPC)
    );

    // At exactly the displaced size the net delta is zero and the rename
    // fits even though the subtree is at its limit.
    rig.engine.truncate(big, 500, &rig.cancel).unwrap();
    rig.engine
        .rename(a, OsStr::new("big"), b, OsStr::new("target"), &rig.cancel)
        .unwrap();

    // The displaced bytes were credited exactly once: the subtree is still
    // at 1000 of 1000, with no headroom invented and none leaked.
    let moved = rig.engine.lookup(b, OsStr::new("target")).unwrap().0;
    assert_eq!(
        rig.engine.write(moved, 500, &[4u8; 1], &rig.cancel),
        Err(libc::ENOSPC)
    );
    rig.engine.unlink(b, OsStr::new("other"), &rig.cancel).unwrap();
    assert_eq!(rig.engine.write(moved, 500, &[4u8; 500], &rig.cancel), Ok(500));
}

#[test]
fn rename_overwrite_within_one_subtree_frees_target_bytes() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "c");
    rig.attach(dir, "bf.effect.maxsize", r#"{"limit":1000}"#);
    let x = rig.create(dir, "x");
    assert_eq!(rig.engine.write(x, 0, &[1u8; 400], &rig.cancel), Ok(400));
    let y = rig.create(dir, "y");
    assert_eq!(rig.engine.write(y, 0, &[2u8; 300], &rig.cancel), Ok(300));

    // Both paths sit under the same effect: the move itself is a wash, but
    // the overwritten target's 300 bytes leave the subtree.
    rig.engine
        .rename(dir, OsStr::new("x"), dir, OsStr::new("y"), &rig.cancel)
        .unwrap();
    let survivor = rig.engine.lookup(dir, OsStr::new("y")).unwrap().0;
    assert_eq!(
        rig.engine.write(survivor, 400, &[3u8; 600], &rig.cancel),
        Ok(600)
    );
    assert_eq!(
        rig.engine.write(survivor, 1000, &[3u8; 1], &rig.cancel),
        Err(libc::ENOSPC)
    );
}

#[test]
fn s4_effects_inherit_down_the_tree_until_detached() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "dir");
    let sub = rig.mkdir(dir, "sub");
    let file = rig.create(sub, "file");

    rig.attach(dir, "bf.effect.flakey", r#"{"prob":1.0,"op":"w"}"#);
    assert_eq!(
        rig.engine.write(file, 0, b"data", &rig.cancel),
        Err(libc::EIO)
    );
    // Reads are out of scope for this effect.
    assert!(rig.engine.read(file, 0, 16, &rig.cancel).is_ok());

    rig.detach(dir, "bf.effect.flakey");
    assert_eq!(rig.engine.write(file, 0, b"data", &rig.cancel), Ok(4));
}

#[test]
fn s5_heatmap_buckets_reads_by_alignment() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "t.txt");
    rig.engine
        .write(file, 0, &[0u8; 6000], &rig.cancel)
        .unwrap();
    rig.attach(file, "bf.effect.heatmap", r#"{"align":4096}"#);

    rig.engine.read(file, 0, 100, &rig.cancel).unwrap();
    rig.engine.read(file, 5000, 100, &rig.cancel).unwrap();

    let rendered = rig
        .engine
        .xattr_get(file, OsStr::new("bf.effect.heatmap"))
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&rendered).unwrap();
    assert_eq!(value, serde_json::json!({"0": {"r": 1}, "4096": {"r": 1}}));
}

#[test]
fn s6_same_kind_effects_with_suffixes_stack() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "t.txt");
    rig.attach(file, "bf.effect.delay-1", r#"{"duration_ms":100}"#);
    rig.attach(file, "bf.effect.delay-2", r#"{"duration_ms":200}"#);
    rig.engine.read(file, 0, 1, &rig.cancel).unwrap();
    assert_eq!(rig.clock.recorded_sleeps(), vec![Duration::from_millis(300)]);
}

#[test]
fn passthrough_identity_with_no_effects() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "d");
    let file = rig.create(dir, "f");
    rig.engine.write(file, 0, b"hello world", &rig.cancel).unwrap();
    rig.engine.truncate(file, 5, &rig.cancel).unwrap();
    assert_eq!(rig.engine.read(file, 0, 64, &rig.cancel).unwrap(), b"hello");
    assert_eq!(rig.engine.getattr(file).unwrap().size, 5);

    rig.engine
        .rename(dir, OsStr::new("f"), ROOT_INO, OsStr::new("g"), &rig.cancel)
        .unwrap();
    let (ino, attr) = rig.engine.lookup(ROOT_INO, OsStr::new("g")).unwrap();
    assert_eq!(ino, file);
    assert_eq!(attr.size, 5);

    let names: Vec<_> = rig
        .engine
        .readdir(ROOT_INO, &rig.cancel)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"g".into()));
    assert!(names.contains(&"d".into()));
    assert!(rig.clock.recorded_sleeps().is_empty());
}

#[test]
fn counter_accounting_sums_to_op_count() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "f");
    rig.attach(file, "bf.effect.flakey", r#"{"prob":0.5}"#);

    let mut attempted = 0u64;
    for i in 0..200u64 {
        attempted += 2;
        let _ = rig.engine.write(file, i, &[0u8; 3], &rig.cancel);
        let _ = rig.engine.read(file, 0, 3, &rig.cancel);
    }

    let stats = rig
        .engine
        .xattr_get(file, OsStr::new("bf.stats"))
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&stats).unwrap();
    let reads = value["reads"].as_u64().unwrap();
    let writes = value["writes"].as_u64().unwrap();
    let errors = value["errors"].as_u64().unwrap();
    assert_eq!(reads + writes + errors, attempted);
    assert_eq!(value["write_volume"].as_u64().unwrap(), writes * 3);

    // Reset wipes the ledger.
    rig.engine
        .xattr_set(file, OsStr::new("bf.stats"), b"0")
        .unwrap();
    let stats = rig
        .engine
        .xattr_get(file, OsStr::new("bf.stats"))
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&stats).unwrap();
    assert_eq!(value["reads"].as_u64(), Some(0));
    assert_eq!(value["errors"].as_u64(), Some(0));
}

#[test]
fn windowed_flakey_partitions_time() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "f");
    rig.engine.write(file, 0, b"x", &rig.cancel).unwrap();
    // Attached at t0; available 300ms, unavailable 200ms, repeating.
    rig.attach(
        file,
        "bf.effect.flakey",
        r#"{"avail":300,"unavail":200,"errno":5,"op":"r"}"#,
    );

    let t0 = rig.clock.now_ms();
    let step_to = |t: u64| {
        let now = rig.clock.now_ms();
        rig.clock.advance(t0 + t - now);
    };
    for (t, available) in [
        (0, true),
        (299, true),
        (300, false),
        (499, false),
        (500, true),
        (799, true),
        (800, false),
        (1_050, true),
    ] {
        step_to(t);
        let outcome = rig.engine.read(file, 0, 1, &rig.cancel);
        let in_avail = ((rig.clock.now_ms() - t0) % 500) < 300;
        assert_eq!(in_avail, available, "test table is self-consistent at {t}");
        assert_eq!(outcome.is_ok(), available, "t={t}");
    }
}

#[test]
fn xattr_values_round_trip_normalized() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "f");
    for (name, set, expect) in [
        (
            "bf.effect.delay",
            r#"{"op":"r","duration_ms":250}"#,
            serde_json::json!({"duration_ms":250,"op":"r"}),
        ),
        (
            "bf.effect.flakey",
            r#"{"prob":0.5}"#,
            serde_json::json!({"errno":5,"prob":0.5}),
        ),
        (
            "bf.effect.maxsize",
            r#"{"limit":4096}"#,
            serde_json::json!({"limit":4096}),
        ),
        (
            "bf.effect.quota",
            r#"{"limit":8192,"align":512}"#,
            serde_json::json!({"align":512,"limit":8192}),
        ),
    ] {
        rig.attach(file, name, set);
        let back = rig.engine.xattr_get(file, OsStr::new(name)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&back).unwrap();
        assert_eq!(value, expect, "{name}");
    }
}

#[test]
fn removing_an_absent_effect_is_enodata_and_touches_nothing() {
    let rig = rig();
    let file = rig.create(ROOT_INO, "f");
    rig.attach(file, "bf.effect.delay", r#"{"duration_ms":10}"#);
    assert_eq!(
        rig.engine
            .xattr_remove(file, OsStr::new("bf.effect.quota")),
        Err(libc::ENODATA)
    );
    // The unrelated effect is untouched.
    assert!(
        rig.engine
            .xattr_get(file, OsStr::new("bf.effect.delay"))
            .is_ok()
    );
}

#[test]
fn quota_rounds_and_refuses_over_limit() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "d");
    rig.attach(dir, "bf.effect.quota", r#"{"limit":2048,"align":1024}"#);
    let file = rig.create(dir, "f");

    // 1 byte rounds to a full 1024 block of quota.
    assert_eq!(rig.engine.write(file, 0, &[0u8; 1], &rig.cancel), Ok(1));
    assert_eq!(rig.engine.read(file, 0, 1, &rig.cancel).unwrap().len(), 1);
    assert_eq!(
        rig.engine.write(file, 0, &[0u8; 1], &rig.cancel),
        Err(libc::EDQUOT)
    );
}

#[test]
fn catch_all_removal_is_single_node_scoped() {
    let rig = rig();
    let dir = rig.mkdir(ROOT_INO, "d");
    let file = rig.create(dir, "f");
    rig.attach(dir, "bf.effect.delay", r#"{"duration_ms":100,"op":"r"}"#);
    rig.attach(file, "bf.effect.delay", r#"{"duration_ms":100,"op":"r"}"#);

    rig.engine
        .xattr_remove(file, OsStr::new("bf.effect"))
        .unwrap();
    rig.engine.read(file, 0, 1, &rig.cancel).unwrap();
    // The ancestor's delay still applies.
    assert_eq!(rig.clock.total_slept(), Duration::from_millis(100));

    let all = rig
        .engine
        .xattr_get(file, OsStr::new("bf.effect/all"))
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&all).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"delay": {"duration_ms":100,"op":"r"}})
    );
}

#[test]
fn concurrent_writes_cannot_overshoot_max_size() {
    use std::thread;

    let clock = Arc::new(brokenfuse::clock::SystemClock);
    let engine = Arc::new(Engine::new(
        Arc::new(MemBacking::new()),
        clock,
        Arc::new(SharedRng::seeded(1)),
    ));
    let cancel = CancelToken::new();
    let dir = engine
        .mkdir(ROOT_INO, OsStr::new("d"), 0o755, &cancel)
        .unwrap()
        .0;
    engine
        .xattr_set(
            dir,
            OsStr::new("bf.effect.maxsize"),
            br#"{"limit":1000}"#,
        )
        .unwrap();
    let a = engine
        .create(dir, OsStr::new("a"), 0o644, &cancel)
        .unwrap()
        .0;
    let b = engine
        .create(dir, OsStr::new("b"), 0o644, &cancel)
        .unwrap()
        .0;

    let mut handles = Vec::new();
    for ino in [a, b] {
        let engine = engine.clone();
        handles.push(thread::spawn(move || {
            let cancel = CancelToken::new();
            engine.write(ino, 0, &[0u8; 600], &cancel).is_ok()
        }));
    }
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    // 600 + 600 > 1000: the reservation protocol admits exactly one.
    assert_eq!(successes, 1);
}
