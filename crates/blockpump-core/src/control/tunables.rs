//! Tunable objects exposed on the control channel
//!
//! A tunable maps a public object id to an engine control handle and says
//! which values are acceptable. Validation happens here, before the engine is
//! called.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ControlError, ControlResult, Reply};
use crate::engine::{ControlHandle, EngineError, ProcessingEngine};

/// Accepted value domain of a tunable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunableKind {
    /// Inclusive float range
    Float { min: f32, max: f32 },
    /// 0 or 1 after truncation toward zero
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunable {
    pub object_id: i64,
    pub name: String,
    pub handle: ControlHandle,
    /// Element offset inside the engine parameter
    #[serde(default)]
    pub offset: usize,
    #[serde(flatten)]
    pub kind: TunableKind,
    /// Engine-side receive name, for engines that address parameters by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

impl Tunable {
    pub fn float(object_id: i64, name: &str, handle: ControlHandle, min: f32, max: f32) -> Self {
        Self {
            object_id,
            name: name.to_string(),
            handle,
            offset: 0,
            kind: TunableKind::Float { min, max },
            receiver: None,
        }
    }

    pub fn toggle(object_id: i64, name: &str, handle: ControlHandle) -> Self {
        Self {
            object_id,
            name: name.to_string(),
            handle,
            offset: 0,
            kind: TunableKind::Toggle,
            receiver: None,
        }
    }

    /// Value to hand to the engine, or `None` when out of domain
    pub fn engine_value(&self, value: f32) -> Option<f32> {
        match self.kind {
            TunableKind::Float { min, max } => (min..=max).contains(&value).then_some(value),
            TunableKind::Toggle => {
                let truncated = value.trunc();
                if truncated == 0.0 {
                    Some(0.0)
                } else if truncated == 1.0 {
                    Some(1.0)
                } else {
                    None
                }
            }
        }
    }
}

/// Object ids 30001 (masterGain, dB) and 30002 (isMuted)
pub fn default_tunables() -> Vec<Tunable> {
    vec![
        Tunable::float(30001, "masterGain", ControlHandle(0x0753_1008), -60.0, 24.0),
        Tunable::toggle(30002, "isMuted", ControlHandle(0x0753_2008)),
    ]
}

/// Known tunables by object id
#[derive(Debug, Clone)]
pub struct TunableRegistry {
    by_id: BTreeMap<i64, Tunable>,
}

impl TunableRegistry {
    pub fn new(tunables: Vec<Tunable>) -> ControlResult<Self> {
        let mut by_id = BTreeMap::new();
        for tunable in tunables {
            if let TunableKind::Float { min, max } = tunable.kind {
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(ControlError::InvalidRange {
                        object_id: tunable.object_id,
                        min,
                        max,
                    });
                }
            }
            let id = tunable.object_id;
            if by_id.insert(id, tunable).is_some() {
                return Err(ControlError::DuplicateObject(id));
            }
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, object_id: i64) -> Option<&Tunable> {
        self.by_id.get(&object_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tunable> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Validate and forward a `set` to the engine
    pub fn apply(&self, engine: &dyn ProcessingEngine, object_id: i64, value: f32) -> Reply {
        let Some(tunable) = self.get(object_id) else {
            return Reply::InvalidObject;
        };
        let Some(engine_value) = tunable.engine_value(value) else {
            return Reply::InvalidValue;
        };

        match engine.set_parameter(tunable.handle, &[engine_value], tunable.offset) {
            Ok(()) => {
                log::info!("Control: {} ({}) = {}", tunable.name, object_id, engine_value);
                Reply::Ok
            }
            Err(e) => {
                log::warn!("Control: engine rejected {} = {}: {}", tunable.name, engine_value, e);
                match e {
                    EngineError::InvalidHandle(_) => Reply::InvalidObject,
                    EngineError::SizeMismatch { .. } => Reply::InvalidValue,
                    _ => Reply::EngineError,
                }
            }
        }
    }
}

impl Default for TunableRegistry {
    fn default() -> Self {
        Self {
            by_id: default_tunables()
                .into_iter()
                .map(|t| (t.object_id, t))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineLayout, MixdownEngine};

    #[test]
    fn test_float_range_inclusive() {
        let gain = &default_tunables()[0];
        assert_eq!(gain.engine_value(-60.0), Some(-60.0));
        assert_eq!(gain.engine_value(24.0), Some(24.0));
        assert_eq!(gain.engine_value(24.5), None);
        assert_eq!(gain.engine_value(f32::NAN), None);
    }

    #[test]
    fn test_toggle_truncates() {
        let mute = &default_tunables()[1];
        assert_eq!(mute.engine_value(1.9), Some(1.0));
        assert_eq!(mute.engine_value(0.4), Some(0.0));
        assert_eq!(mute.engine_value(-0.5), Some(0.0));
        assert_eq!(mute.engine_value(2.0), None);
        assert_eq!(mute.engine_value(-1.0), None);
    }

    #[test]
    fn test_registry_rejects_bad_tables() {
        let dup = vec![
            Tunable::toggle(1, "a", ControlHandle(1)),
            Tunable::toggle(1, "b", ControlHandle(2)),
        ];
        assert!(matches!(
            TunableRegistry::new(dup),
            Err(ControlError::DuplicateObject(1))
        ));

        let inverted = vec![Tunable::float(2, "x", ControlHandle(3), 5.0, -5.0)];
        assert!(matches!(
            TunableRegistry::new(inverted),
            Err(ControlError::InvalidRange { object_id: 2, .. })
        ));
    }

    #[test]
    fn test_apply_sets_engine_parameter() {
        let engine = MixdownEngine::with_fold_graph(EngineLayout::default()).unwrap();
        let registry = TunableRegistry::default();

        assert_eq!(registry.apply(&engine, 30001, 0.0), Reply::Ok);
        assert_eq!(registry.apply(&engine, 30001, 100.0), Reply::InvalidValue);
        assert_eq!(registry.apply(&engine, 99999, 0.0), Reply::InvalidObject);
        assert_eq!(registry.apply(&engine, 30002, 1.0), Reply::Ok);

        let mut gain = [1.0];
        engine.get_parameter(ControlHandle(0x0753_1008), &mut gain, 0).unwrap();
        assert_eq!(gain, [0.0]);
        let mut mute = [0.0];
        engine.get_parameter(ControlHandle(0x0753_2008), &mut mute, 0).unwrap();
        assert_eq!(mute, [1.0]);
    }

    #[test]
    fn test_apply_reports_engine_refusal() {
        let engine = MixdownEngine::new(EngineLayout::default());
        let registry = TunableRegistry::default();
        assert_eq!(registry.apply(&engine, 30001, 0.0), Reply::EngineError);
    }

    #[test]
    fn test_tunable_yaml_shape() {
        let yaml = "object_id: 30003\nname: trim\nhandle: 42\nkind: float\nmin: -6.0\nmax: 6.0\n";
        let tunable: Tunable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tunable, Tunable::float(30003, "trim", ControlHandle(42), -6.0, 6.0));

        let yaml = "object_id: 30004\nname: bypass\nhandle: 43\nkind: toggle\nreceiver: $0-bypass\n";
        let tunable: Tunable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tunable.kind, TunableKind::Toggle);
        assert_eq!(tunable.receiver.as_deref(), Some("$0-bypass"));
    }
}
