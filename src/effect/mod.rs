//! Effect registry: the closed catalog of fault-injection effect kinds.
//!
//! Each kind lives in its own module and declares a config schema (serde,
//! unknown fields rejected), mutable runtime state behind its own lock, and
//! an evaluator. The engine composes effects per operation; this module only
//! defines the pieces.

use libc::c_int;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::SharedRng;

mod delay;
mod flakey;
mod heatmap;
mod max_size;
mod quota;

pub use delay::DelayEffect;
pub use flakey::{FlakeyEffect, FlakeyMode};
pub use heatmap::HeatmapEffect;
pub use max_size::MaxSizeEffect;
pub use quota::QuotaEffect;

/// Restricts an effect to reads or writes. Absent means both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpClass {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
}

pub(crate) fn class_matches(filter: Option<OpClass>, class: OpClass) -> bool {
    filter.is_none_or(|f| f == class)
}

/// What a pre-phase evaluator tells the interceptor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Delay(std::time::Duration),
    Fail(c_int),
}

/// When an effect runs relative to the backing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

/// A malformed or invalid effect value. Surfaces as EINVAL on `setxattr`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("effect value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid effect config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Delay,
    Flakey,
    MaxSize,
    Heatmap,
    Quota,
}

impl EffectKind {
    /// Parse the `<kind>` token of a `bf.effect.<kind>` xattr name.
    pub fn from_token(token: &str) -> Option<EffectKind> {
        match token {
            "delay" => Some(EffectKind::Delay),
            "flakey" => Some(EffectKind::Flakey),
            "maxsize" => Some(EffectKind::MaxSize),
            "heatmap" => Some(EffectKind::Heatmap),
            "quota" => Some(EffectKind::Quota),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            EffectKind::Delay => "delay",
            EffectKind::Flakey => "flakey",
            EffectKind::MaxSize => "maxsize",
            EffectKind::Heatmap => "heatmap",
            EffectKind::Quota => "quota",
        }
    }
}

/// One configured effect attached to a node.
///
/// Identity within a node is `(kind, suffix)`; attaching a second effect
/// with the same identity replaces the first.
pub struct Effect {
    kind: EffectKind,
    suffix: String,
    seq: u64,
    attached_at_ms: u64,
    body: EffectBody,
}

/// Closed enumeration of effect kinds; the interceptor switches on this.
pub enum EffectBody {
    Delay(DelayEffect),
    Flakey(FlakeyEffect),
    MaxSize(MaxSizeEffect),
    Heatmap(HeatmapEffect),
    Quota(QuotaEffect),
}

impl Effect {
    /// Parse `value` against `kind`'s schema. `seq` orders attachments and
    /// `attached_at_ms` anchors windowed Flakey timelines.
    pub fn parse(
        kind: EffectKind,
        suffix: &str,
        value: &[u8],
        attached_at_ms: u64,
        seq: u64,
    ) -> Result<Effect, ConfigError> {
        let body = match kind {
            EffectKind::Delay => EffectBody::Delay(DelayEffect::parse(value)?),
            EffectKind::Flakey => EffectBody::Flakey(FlakeyEffect::parse(value)?),
            EffectKind::MaxSize => EffectBody::MaxSize(MaxSizeEffect::parse(value)?),
            EffectKind::Heatmap => EffectBody::Heatmap(HeatmapEffect::parse(value)?),
            EffectKind::Quota => EffectBody::Quota(QuotaEffect::parse(value)?),
        };
        Ok(Effect {
            kind,
            suffix: suffix.to_string(),
            seq,
            attached_at_ms,
            body,
        })
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn body(&self) -> &EffectBody {
        &self.body
    }

    pub fn phase(&self) -> Phase {
        match self.body {
            EffectBody::Heatmap(_) => Phase::Post,
            _ => Phase::Pre,
        }
    }

    /// The xattr name component: `<kind>` or `<kind>-<suffix>`.
    pub fn display_name(&self) -> String {
        if self.suffix.is_empty() {
            self.kind.token().to_string()
        } else {
            format!("{}-{}", self.kind.token(), self.suffix)
        }
    }

    /// Pre-phase evaluation for stateless checks (Delay, Flakey). MaxSize
    /// and Quota reservations go through their own methods because they
    /// carry rollback obligations.
    pub fn evaluate_pre(&self, class: OpClass, now_ms: u64, rng: &SharedRng) -> Action {
        match &self.body {
            EffectBody::Delay(d) => d.evaluate(class),
            EffectBody::Flakey(f) => f.evaluate(class, now_ms, self.attached_at_ms, rng),
            _ => Action::Continue,
        }
    }

    /// Normalized JSON rendering served by `getxattr`.
    pub fn render(&self) -> serde_json::Value {
        match &self.body {
            EffectBody::Delay(d) => d.render(),
            EffectBody::Flakey(f) => f.render(),
            EffectBody::MaxSize(m) => m.render(),
            EffectBody::Heatmap(h) => h.render(),
            EffectBody::Quota(q) => q.render(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tokens_round_trip() {
        for kind in [
            EffectKind::Delay,
            EffectKind::Flakey,
            EffectKind::MaxSize,
            EffectKind::Heatmap,
            EffectKind::Quota,
        ] {
            assert_eq!(EffectKind::from_token(kind.token()), Some(kind));
        }
        assert_eq!(EffectKind::from_token("delayx"), None);
    }

    #[test]
    fn display_name_includes_suffix() {
        let e = Effect::parse(EffectKind::Delay, "1", br#"{"duration_ms":10}"#, 0, 0).unwrap();
        assert_eq!(e.display_name(), "delay-1");
        let e = Effect::parse(EffectKind::Delay, "", br#"{"duration_ms":10}"#, 0, 1).unwrap();
        assert_eq!(e.display_name(), "delay");
    }

    #[test]
    fn heatmap_is_post_everything_else_pre() {
        let heatmap = Effect::parse(EffectKind::Heatmap, "", br#"{"align":4096}"#, 0, 0).unwrap();
        assert_eq!(heatmap.phase(), Phase::Post);
        let delay = Effect::parse(EffectKind::Delay, "", br#"{"duration_ms":1}"#, 0, 1).unwrap();
        assert_eq!(delay.phase(), Phase::Pre);
    }
}
