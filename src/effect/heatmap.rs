//! Heatmap effect: record per-region access counts, bucketed by alignment.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ConfigError, OpClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeatmapConf {
    align: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketCounts {
    pub reads: u64,
    pub writes: u64,
}

pub struct HeatmapEffect {
    conf: HeatmapConf,
    // Sparse: bucket start offset -> counts.
    buckets: Mutex<BTreeMap<u64, BucketCounts>>,
}

impl HeatmapEffect {
    pub(super) fn parse(value: &[u8]) -> Result<HeatmapEffect, ConfigError> {
        let conf: HeatmapConf = serde_json::from_slice(value)?;
        if conf.align == 0 {
            return Err(ConfigError::Invalid("align must be at least 1"));
        }
        Ok(HeatmapEffect {
            conf,
            buckets: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn align(&self) -> u64 {
        self.conf.align
    }

    /// Record one access to `[offset, offset + len)`. Attempts are recorded
    /// whether or not the op ultimately succeeded.
    pub fn record(&self, class: OpClass, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let align = self.conf.align;
        let first = offset / align * align;
        let end = (offset + len).div_ceil(align) * align;
        let mut buckets = self.buckets.lock();
        let mut bucket = first;
        while bucket < end {
            let counts = buckets.entry(bucket).or_default();
            match class {
                OpClass::Read => counts.reads += 1,
                OpClass::Write => counts.writes += 1,
            }
            bucket += align;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<u64, BucketCounts> {
        self.buckets.lock().clone()
    }

    /// JSON object keyed by bucket offset; zero counters are omitted.
    pub fn render(&self) -> serde_json::Value {
        let buckets = self.buckets.lock();
        let mut map = serde_json::Map::new();
        for (offset, counts) in buckets.iter() {
            let mut entry = serde_json::Map::new();
            if counts.reads > 0 {
                entry.insert("r".to_string(), json!(counts.reads));
            }
            if counts.writes > 0 {
                entry.insert("w".to_string(), json!(counts.writes));
            }
            map.insert(offset.to_string(), serde_json::Value::Object(entry));
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_round_down_and_up() {
        let h = HeatmapEffect::parse(br#"{"align": 4096}"#).unwrap();
        h.record(OpClass::Read, 0, 100);
        h.record(OpClass::Read, 5000, 100);
        let snap = h.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&0].reads, 1);
        assert_eq!(snap[&4096].reads, 1);
        assert_eq!(
            h.render(),
            serde_json::json!({"0": {"r": 1}, "4096": {"r": 1}})
        );
    }

    #[test]
    fn range_spanning_buckets_touches_each() {
        let h = HeatmapEffect::parse(br#"{"align": 100}"#).unwrap();
        h.record(OpClass::Write, 50, 200);
        let snap = h.snapshot();
        assert_eq!(
            snap.keys().copied().collect::<Vec<_>>(),
            vec![0, 100, 200]
        );
        assert!(snap.values().all(|c| c.writes == 1 && c.reads == 0));
    }

    #[test]
    fn zero_length_records_nothing() {
        let h = HeatmapEffect::parse(br#"{"align": 8}"#).unwrap();
        h.record(OpClass::Read, 10, 0);
        assert!(h.snapshot().is_empty());
    }

    #[test]
    fn zero_align_is_invalid() {
        assert!(HeatmapEffect::parse(br#"{"align": 0}"#).is_err());
    }
}
