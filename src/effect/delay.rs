//! Delay effect: sleep before the backing call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Action, ConfigError, OpClass, class_matches};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DelayConf {
    duration_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<OpClass>,
}

pub struct DelayEffect {
    conf: DelayConf,
}

impl DelayEffect {
    pub(super) fn parse(value: &[u8]) -> Result<DelayEffect, ConfigError> {
        let conf: DelayConf = serde_json::from_slice(value)?;
        Ok(DelayEffect { conf })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.conf.duration_ms))
    }

    pub fn evaluate(&self, class: OpClass) -> Action {
        if class_matches(self.conf.op, class) {
            Action::Delay(self.duration())
        } else {
            Action::Continue
        }
    }

    pub fn render(&self) -> serde_json::Value {
        serde_json::to_value(&self.conf).unwrap_or(serde_json::Value::Null)
    }
}
