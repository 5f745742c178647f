//! The `bf.*` xattr control plane.
//!
//! Effects are attached, inspected, and removed through extended attributes
//! under the `bf.` prefix (a leading `user.` is tolerated for hosts that
//! force the user namespace). Everything else is passed through to the
//! backing store by the interceptor.

use std::ffi::OsStr;
use std::str;
use std::sync::Arc;

use libc::c_int;
use log::debug;
use thiserror::Error;

use crate::clock::Clock;
use crate::effect::{ConfigError, Effect, EffectKind};
use crate::node::NodeTable;

const PREFIX: &str = "bf.";
const USER_PREFIX: &str = "user.";

/// A parsed `bf.*` xattr name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlName {
    /// `bf.effect` — the catch-all.
    AllEffects,
    /// `bf.effect/all` — the effective (inherited + own) set, read only.
    EffectiveSet,
    /// `bf.stats` — counters; get reads, set resets.
    Stats,
    /// `bf.effect.<kind>` or `bf.effect.<kind>-<suffix>`.
    Effect { kind: EffectKind, suffix: String },
    /// A `bf.`-prefixed name this daemon does not recognize.
    Unknown,
}

impl ControlName {
    /// Classify an inbound xattr name. `None` means the name is not ours
    /// and belongs to the backing store.
    pub fn parse(name: &OsStr) -> Option<ControlName> {
        let bytes = name.as_encoded_bytes();
        let text = match str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return None,
        };
        let text = text.strip_prefix(USER_PREFIX).unwrap_or(text);
        let rest = text.strip_prefix(PREFIX)?;

        Some(match rest {
            "effect" => ControlName::AllEffects,
            "effect/all" => ControlName::EffectiveSet,
            "stats" => ControlName::Stats,
            _ => match rest.strip_prefix("effect.") {
                Some(tail) => {
                    let (kind_token, suffix) = match tail.split_once('-') {
                        Some((kind, suffix)) => (kind, suffix),
                        None => (tail, ""),
                    };
                    match EffectKind::from_token(kind_token) {
                        Some(kind) => ControlName::Effect {
                            kind,
                            suffix: suffix.to_string(),
                        },
                        None => ControlName::Unknown,
                    }
                }
                None => ControlName::Unknown,
            },
        })
    }
}

/// Control-plane failures and the errno each maps to.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid effect configuration")]
    Config(#[from] ConfigError),
    #[error("this name cannot be written")]
    NotWritable,
    #[error("no such node")]
    NoNode,
    #[error("no such effect or attribute")]
    NoData,
    #[error("unrecognized control attribute")]
    Unsupported,
}

impl ControlError {
    pub fn errno(&self) -> c_int {
        match self {
            ControlError::Config(_) | ControlError::NotWritable => libc::EINVAL,
            ControlError::NoNode => libc::ENOENT,
            ControlError::NoData => libc::ENODATA,
            ControlError::Unsupported => libc::ENOTSUP,
        }
    }
}

/// Interprets `bf.*` requests against the node table.
pub struct ControlPlane {
    table: Arc<NodeTable>,
    clock: Arc<dyn Clock>,
}

impl ControlPlane {
    pub fn new(table: Arc<NodeTable>, clock: Arc<dyn Clock>) -> ControlPlane {
        ControlPlane { table, clock }
    }

    pub fn set(&self, ino: u64, name: &ControlName, value: &[u8]) -> Result<(), ControlError> {
        let node = self.table.get(ino).ok_or(ControlError::NoNode)?;
        match name {
            ControlName::Effect { kind, suffix } => {
                let effect = Effect::parse(
                    *kind,
                    suffix,
                    value,
                    self.clock.now_ms(),
                    self.table.next_effect_seq(),
                )?;
                debug!("attach {} to ino {ino}", effect.display_name());
                node.attach(effect);
                Ok(())
            }
            ControlName::Stats => {
                // Any value resets the counters.
                node.counters.reset();
                Ok(())
            }
            ControlName::AllEffects | ControlName::EffectiveSet => Err(ControlError::NotWritable),
            ControlName::Unknown => Err(ControlError::Unsupported),
        }
    }

    pub fn get(&self, ino: u64, name: &ControlName) -> Result<Vec<u8>, ControlError> {
        let node = self.table.get(ino).ok_or(ControlError::NoNode)?;
        let value = match name {
            ControlName::Effect { kind, suffix } => {
                let effect = node
                    .find_effect(*kind, suffix)
                    .ok_or(ControlError::NoData)?;
                effect.render()
            }
            ControlName::AllEffects => {
                let mut map = serde_json::Map::new();
                for effect in node.effects() {
                    map.insert(effect.display_name(), effect.render());
                }
                serde_json::Value::Object(map)
            }
            ControlName::EffectiveSet => {
                let chain = self.table.chain(ino).ok_or(ControlError::NoNode)?;
                let mut map = serde_json::Map::new();
                // Root first, so the nearest node wins on a key collision.
                for node in &chain {
                    for effect in node.effects() {
                        map.insert(effect.display_name(), effect.render());
                    }
                }
                serde_json::Value::Object(map)
            }
            ControlName::Stats => {
                serde_json::to_value(node.counters.snapshot()).unwrap_or(serde_json::Value::Null)
            }
            ControlName::Unknown => return Err(ControlError::NoData),
        };
        Ok(value.to_string().into_bytes())
    }

    pub fn remove(&self, ino: u64, name: &ControlName) -> Result<(), ControlError> {
        let node = self.table.get(ino).ok_or(ControlError::NoNode)?;
        match name {
            ControlName::Effect { kind, suffix } => {
                if node.detach(*kind, suffix) {
                    debug!("detach {}-{suffix:?} from ino {ino}", kind.token());
                    Ok(())
                } else {
                    Err(ControlError::NoData)
                }
            }
            // Removes every effect on this node, never on ancestors.
            ControlName::AllEffects => {
                node.clear_effects();
                Ok(())
            }
            ControlName::EffectiveSet | ControlName::Stats | ControlName::Unknown => {
                Err(ControlError::NoData)
            }
        }
    }

    /// Control-plane names this node would answer for, for `listxattr`.
    pub fn list_names(&self, ino: u64) -> Vec<Vec<u8>> {
        let Some(node) = self.table.get(ino) else {
            return Vec::new();
        };
        let mut names = vec![b"bf.effect".to_vec(), b"bf.stats".to_vec()];
        for effect in node.effects() {
            names.push(format!("bf.effect.{}", effect.display_name()).into_bytes());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::node::ROOT_INO;
    use serde_json::json;

    fn plane() -> (Arc<NodeTable>, ControlPlane) {
        let table = Arc::new(NodeTable::new());
        let clock = Arc::new(ManualClock::new(0));
        (table.clone(), ControlPlane::new(table, clock))
    }

    fn parsed(name: &str) -> ControlName {
        ControlName::parse(OsStr::new(name)).unwrap()
    }

    #[test]
    fn name_classification() {
        assert_eq!(parsed("bf.effect"), ControlName::AllEffects);
        assert_eq!(parsed("bf.effect/all"), ControlName::EffectiveSet);
        assert_eq!(parsed("bf.stats"), ControlName::Stats);
        assert_eq!(
            parsed("bf.effect.delay"),
            ControlName::Effect {
                kind: EffectKind::Delay,
                suffix: String::new()
            }
        );
        assert_eq!(
            parsed("user.bf.effect.delay-slow"),
            ControlName::Effect {
                kind: EffectKind::Delay,
                suffix: "slow".to_string()
            }
        );
        assert_eq!(parsed("bf.effect.wat"), ControlName::Unknown);
        assert_eq!(parsed("bf.wat"), ControlName::Unknown);
        assert_eq!(ControlName::parse(OsStr::new("user.color")), None);
        assert_eq!(ControlName::parse(OsStr::new("security.selinux")), None);
    }

    #[test]
    fn set_and_get_normalizes() {
        let (_table, plane) = plane();
        let name = parsed("bf.effect.flakey");
        plane
            .set(ROOT_INO, &name, br#"{"prob": 0.25}"#)
            .unwrap();
        let value = plane.get(ROOT_INO, &name).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&value).unwrap();
        assert_eq!(parsed, json!({"errno": libc::EIO, "prob": 0.25}));
    }

    #[test]
    fn malformed_set_leaves_no_state() {
        let (table, plane) = plane();
        let name = parsed("bf.effect.delay");
        let err = plane.set(ROOT_INO, &name, br#"{"duration_ms": "x"}"#).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(table.get(ROOT_INO).unwrap().effects().is_empty());
    }

    #[test]
    fn catch_all_set_is_rejected() {
        let (_table, plane) = plane();
        let err = plane
            .set(ROOT_INO, &ControlName::AllEffects, b"{}")
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn remove_is_exact_and_idempotence_reports_nodata() {
        let (_table, plane) = plane();
        plane
            .set(ROOT_INO, &parsed("bf.effect.delay-1"), br#"{"duration_ms":1}"#)
            .unwrap();
        plane
            .set(ROOT_INO, &parsed("bf.effect.delay-2"), br#"{"duration_ms":2}"#)
            .unwrap();
        plane.remove(ROOT_INO, &parsed("bf.effect.delay-1")).unwrap();
        let err = plane
            .remove(ROOT_INO, &parsed("bf.effect.delay-1"))
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENODATA);
        // The sibling survived.
        assert!(plane.get(ROOT_INO, &parsed("bf.effect.delay-2")).is_ok());
    }

    #[test]
    fn catch_all_remove_clears_only_this_node() {
        let (table, plane) = plane();
        let dir = table
            .ensure_child(ROOT_INO, OsStr::new("dir"))
            .unwrap();
        plane
            .set(ROOT_INO, &parsed("bf.effect.delay"), br#"{"duration_ms":1}"#)
            .unwrap();
        plane
            .set(dir.ino(), &parsed("bf.effect.delay"), br#"{"duration_ms":2}"#)
            .unwrap();
        plane.remove(dir.ino(), &ControlName::AllEffects).unwrap();
        assert!(table.get(dir.ino()).unwrap().effects().is_empty());
        assert_eq!(table.get(ROOT_INO).unwrap().effects().len(), 1);
    }

    #[test]
    fn effective_set_includes_ancestors() {
        let (table, plane) = plane();
        let dir = table
            .ensure_child(ROOT_INO, OsStr::new("dir"))
            .unwrap();
        let file = table
            .ensure_child(dir.ino(), OsStr::new("f"))
            .unwrap();
        plane
            .set(ROOT_INO, &parsed("bf.effect.delay"), br#"{"duration_ms":9}"#)
            .unwrap();
        plane
            .set(dir.ino(), &parsed("bf.effect.quota"), br#"{"limit":10,"align":1}"#)
            .unwrap();

        let value = plane.get(file.ino(), &ControlName::EffectiveSet).unwrap();
        let parsed_value: serde_json::Value = serde_json::from_slice(&value).unwrap();
        assert_eq!(
            parsed_value,
            json!({
                "delay": {"duration_ms": 9},
                "quota": {"align": 1, "limit": 10},
            })
        );

        // Own set of the file is empty.
        let own = plane.get(file.ino(), &ControlName::AllEffects).unwrap();
        assert_eq!(String::from_utf8(own).unwrap(), "{}");
    }

    #[test]
    fn stats_get_and_reset() {
        let (table, plane) = plane();
        let node = table.get(ROOT_INO).unwrap();
        node.counters.record_read(64);
        let value = plane.get(ROOT_INO, &ControlName::Stats).unwrap();
        let parsed_value: serde_json::Value = serde_json::from_slice(&value).unwrap();
        assert_eq!(parsed_value["reads"], json!(1));
        assert_eq!(parsed_value["read_volume"], json!(64));

        plane.set(ROOT_INO, &ControlName::Stats, b"0").unwrap();
        let value = plane.get(ROOT_INO, &ControlName::Stats).unwrap();
        let parsed_value: serde_json::Value = serde_json::from_slice(&value).unwrap();
        assert_eq!(parsed_value["reads"], json!(0));
    }

    #[test]
    fn list_names_cover_attached_effects() {
        let (_table, plane) = plane();
        plane
            .set(ROOT_INO, &parsed("bf.effect.heatmap"), br#"{"align":512}"#)
            .unwrap();
        let names = plane.list_names(ROOT_INO);
        assert!(names.contains(&b"bf.effect".to_vec()));
        assert!(names.contains(&b"bf.stats".to_vec()));
        assert!(names.contains(&b"bf.effect.heatmap".to_vec()));
    }
}
