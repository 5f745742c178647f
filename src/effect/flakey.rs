//! Flakey effect: fail operations probabilistically or on a repeating
//! availability schedule.

use libc::c_int;
use serde::Deserialize;
use serde_json::json;

use super::{Action, ConfigError, OpClass, class_matches};
use crate::clock::SharedRng;

/// The two disjoint Flakey configurations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlakeyMode {
    /// Fail each matching op with probability `prob`.
    Prob(f64),
    /// Repeating `avail`-then-`unavail` millisecond windows, anchored at
    /// attach time.
    Window { avail_ms: u32, unavail_ms: u32 },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlakeyRaw {
    #[serde(default)]
    prob: Option<f64>,
    #[serde(default)]
    errno: Option<i32>,
    #[serde(default)]
    avail: Option<u32>,
    #[serde(default)]
    unavail: Option<u32>,
    #[serde(default)]
    op: Option<OpClass>,
}

pub struct FlakeyEffect {
    mode: FlakeyMode,
    errno: c_int,
    op: Option<OpClass>,
}

impl FlakeyEffect {
    pub(super) fn parse(value: &[u8]) -> Result<FlakeyEffect, ConfigError> {
        let raw: FlakeyRaw = serde_json::from_slice(value)?;

        let windowed = raw.avail.is_some() || raw.unavail.is_some();
        let mode = match (raw.prob, windowed) {
            (Some(_), true) => {
                return Err(ConfigError::Invalid(
                    "prob cannot be combined with avail/unavail",
                ));
            }
            (Some(prob), false) => {
                if !(0.0..=1.0).contains(&prob) {
                    return Err(ConfigError::Invalid("prob must be within [0, 1]"));
                }
                FlakeyMode::Prob(prob)
            }
            (None, true) => {
                let (Some(avail_ms), Some(unavail_ms)) = (raw.avail, raw.unavail) else {
                    return Err(ConfigError::Invalid(
                        "windowed flakey requires both avail and unavail",
                    ));
                };
                if avail_ms == 0 && unavail_ms == 0 {
                    return Err(ConfigError::Invalid("avail and unavail cannot both be 0"));
                }
                FlakeyMode::Window {
                    avail_ms,
                    unavail_ms,
                }
            }
            (None, false) => {
                return Err(ConfigError::Invalid(
                    "flakey requires prob or avail/unavail",
                ));
            }
        };

        let errno = raw.errno.unwrap_or(libc::EIO);
        if errno <= 0 {
            return Err(ConfigError::Invalid("errno must be a positive number"));
        }

        Ok(FlakeyEffect {
            mode,
            errno,
            op: raw.op,
        })
    }

    pub fn mode(&self) -> FlakeyMode {
        self.mode
    }

    pub fn evaluate(
        &self,
        class: OpClass,
        now_ms: u64,
        attached_at_ms: u64,
        rng: &SharedRng,
    ) -> Action {
        if !class_matches(self.op, class) {
            return Action::Continue;
        }
        match self.mode {
            FlakeyMode::Prob(prob) => {
                if rng.next_unit() < prob {
                    Action::Fail(self.errno)
                } else {
                    Action::Continue
                }
            }
            FlakeyMode::Window {
                avail_ms,
                unavail_ms,
            } => {
                let period = u64::from(avail_ms) + u64::from(unavail_ms);
                let phase = now_ms.saturating_sub(attached_at_ms) % period;
                if phase < u64::from(avail_ms) {
                    Action::Continue
                } else {
                    Action::Fail(self.errno)
                }
            }
        }
    }

    pub fn render(&self) -> serde_json::Value {
        let mut value = match self.mode {
            FlakeyMode::Prob(prob) => json!({"prob": prob, "errno": self.errno}),
            FlakeyMode::Window {
                avail_ms,
                unavail_ms,
            } => json!({"avail": avail_ms, "unavail": unavail_ms, "errno": self.errno}),
        };
        if let (Some(op), Some(map)) = (self.op, value.as_object_mut()) {
            map.insert(
                "op".to_string(),
                json!(match op {
                    OpClass::Read => "r",
                    OpClass::Write => "w",
                }),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_conflicting_and_incomplete_configs() {
        assert!(FlakeyEffect::parse(br#"{"prob": 0.5, "avail": 10, "unavail": 10}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{"avail": 10}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{"prob": 1.5}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{"prob": 0.5, "nope": 1}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{"avail": 0, "unavail": 0}"#).is_err());
        assert!(FlakeyEffect::parse(br#"{"prob": 0.5, "errno": 0}"#).is_err());
    }

    #[test]
    fn errno_defaults_to_eio() {
        let f = FlakeyEffect::parse(br#"{"prob": 1.0}"#).unwrap();
        let rng = SharedRng::seeded(1);
        assert_eq!(f.evaluate(OpClass::Read, 0, 0, &rng), Action::Fail(libc::EIO));
        assert_eq!(f.render(), json!({"prob": 1.0, "errno": libc::EIO}));
    }

    #[test]
    fn prob_draws_are_deterministic_under_a_seed() {
        let f = FlakeyEffect::parse(br#"{"prob": 0.5, "op": "w"}"#).unwrap();
        let run = |seed| {
            let rng = SharedRng::seeded(seed);
            (0..1000)
                .filter(|_| f.evaluate(OpClass::Write, 0, 0, &rng) != Action::Continue)
                .count()
        };
        let failures = run(42);
        assert_eq!(failures, run(42));
        // Loose binomial bound around 500; a uniform RNG stays well inside.
        assert!((400..=600).contains(&failures), "failures={failures}");
    }

    #[test]
    fn op_filter_skips_the_draw_entirely() {
        let f = FlakeyEffect::parse(br#"{"prob": 1.0, "op": "w"}"#).unwrap();
        let rng = SharedRng::seeded(7);
        assert_eq!(f.evaluate(OpClass::Read, 0, 0, &rng), Action::Continue);
        assert_eq!(f.evaluate(OpClass::Write, 0, 0, &rng), Action::Fail(libc::EIO));
    }

    #[test]
    fn window_partitions_the_timeline_from_attach_time() {
        let f = FlakeyEffect::parse(br#"{"avail": 100, "unavail": 50, "errno": 70}"#).unwrap();
        let rng = SharedRng::seeded(0);
        let attach = 10_000;
        for (t, ok) in [
            (10_000, true),
            (10_099, true),
            (10_100, false),
            (10_149, false),
            (10_150, true),
            (10_399, false),
            (10_450, true),
        ] {
            let action = f.evaluate(OpClass::Read, t, attach, &rng);
            if ok {
                assert_eq!(action, Action::Continue, "t={t}");
            } else {
                assert_eq!(action, Action::Fail(70), "t={t}");
            }
        }
    }
}
