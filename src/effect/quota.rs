//! Quota effect: cap the cumulative operation volume flowing through the
//! subtree rooted at the attachment node.

use libc::c_int;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuotaConf {
    limit: u64,
    align: u64,
}

pub struct QuotaEffect {
    conf: QuotaConf,
    used: Mutex<u64>,
}

impl QuotaEffect {
    pub(super) fn parse(value: &[u8]) -> Result<QuotaEffect, ConfigError> {
        let conf: QuotaConf = serde_json::from_slice(value)?;
        if conf.align == 0 {
            return Err(ConfigError::Invalid("align must be at least 1"));
        }
        Ok(QuotaEffect {
            conf,
            used: Mutex::new(0),
        })
    }

    /// Operation length rounded up to the configured alignment.
    pub fn rounded(&self, len: u64) -> u64 {
        len.div_ceil(self.conf.align) * self.conf.align
    }

    /// Atomically check-and-consume `rounded` volume. Failed ops must give
    /// it back via [`unreserve`](Self::unreserve).
    pub fn try_reserve(&self, rounded: u64) -> Result<(), c_int> {
        let mut used = self.used.lock();
        if used.saturating_add(rounded) > self.conf.limit {
            return Err(libc::EDQUOT);
        }
        *used += rounded;
        Ok(())
    }

    pub fn unreserve(&self, rounded: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(rounded);
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    pub fn render(&self) -> serde_json::Value {
        serde_json::to_value(&self.conf).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_lengths_up_to_align() {
        let q = QuotaEffect::parse(br#"{"limit": 4096, "align": 512}"#).unwrap();
        assert_eq!(q.rounded(0), 0);
        assert_eq!(q.rounded(1), 512);
        assert_eq!(q.rounded(512), 512);
        assert_eq!(q.rounded(513), 1024);
    }

    #[test]
    fn consumes_until_the_limit() {
        let q = QuotaEffect::parse(br#"{"limit": 1024, "align": 512}"#).unwrap();
        assert!(q.try_reserve(q.rounded(100)).is_ok());
        assert!(q.try_reserve(q.rounded(500)).is_ok());
        assert_eq!(q.try_reserve(q.rounded(1)), Err(libc::EDQUOT));
        assert_eq!(q.used(), 1024);
    }

    #[test]
    fn failed_ops_return_their_volume() {
        let q = QuotaEffect::parse(br#"{"limit": 1024, "align": 1}"#).unwrap();
        assert!(q.try_reserve(1000).is_ok());
        q.unreserve(1000);
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn zero_align_is_invalid() {
        assert!(QuotaEffect::parse(br#"{"limit": 10, "align": 0}"#).is_err());
    }
}
