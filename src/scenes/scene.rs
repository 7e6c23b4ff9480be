use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::animation::fade_factor;

pub type UniverseId = u16;
pub type ChannelId = u16;

/// { channel: value }
pub type DmxValues = BTreeMap<ChannelId, u8>;

/// { universe: { channel: value } }
pub type DmxData = BTreeMap<UniverseId, DmxValues>;

/// { universe: { channel: effect } }
pub type DmxEffects = BTreeMap<UniverseId, BTreeMap<ChannelId, EffectDescriptor>>;

pub const MAX_MASTER: u8 = 100;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EffectDescriptor {
    /// Sinusoidal dimmer modulation
    Wave {
        bpm: f64,
        /// Fraction of a period, `[0,1)`; when absent the phase is assigned
        /// from the scene's channel permutation
        #[serde(default)]
        phase: Option<f64>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: String,
    /// Epoch milliseconds
    pub created: i64,
    /// Epoch milliseconds, bumped on every change
    pub updated: i64,
    pub name: String,
    pub color: String,
    pub category: String,
    #[serde(default)]
    pub sort_index: i64,
    #[serde(default)]
    pub dmx_data: DmxData,
    #[serde(default)]
    pub dmx_effects: DmxEffects,
    /// Scene-wide effect, applied to every populated channel without its own effect
    #[serde(default)]
    pub effect_bpm: Option<f64>,
    #[serde(default)]
    pub enabled: bool,
    pub master: u8,
    #[serde(default)]
    pub use_master: bool,
    /// Fade duration in ms; 0 means instantaneous
    #[serde(default)]
    pub fade: u64,
    #[serde(default)]
    pub fade_enable_completed: i64,
    #[serde(default)]
    pub fade_disable_completed: i64,
    #[serde(default)]
    pub mqtt_toggle_topic: Option<String>,
    #[serde(default)]
    pub mqtt_toggle_path: String,
    #[serde(default)]
    pub mqtt_toggle_value: String,
}

impl Scene {
    pub fn new(id: String, name: String, now: i64) -> Self {
        Scene {
            id,
            created: now,
            updated: now,
            name,
            color: String::new(),
            category: String::new(),
            sort_index: 0,
            dmx_data: DmxData::new(),
            dmx_effects: DmxEffects::new(),
            effect_bpm: None,
            enabled: false,
            master: MAX_MASTER,
            use_master: false,
            fade: 0,
            fade_enable_completed: 0,
            fade_disable_completed: 0,
            mqtt_toggle_topic: None,
            mqtt_toggle_path: String::new(),
            mqtt_toggle_value: String::new(),
        }
    }

    /// Whether the scene contributes to output at `now`, i.e. enabled or
    /// still fading out
    pub fn is_live(&self, now: i64) -> bool {
        self.enabled || now < self.fade_disable_completed
    }

    pub fn master_dimmer(&self) -> f64 {
        if self.use_master {
            self.master as f64 / MAX_MASTER as f64
        } else {
            1.0
        }
    }

    pub fn fade_dimmer(&self, now: i64) -> f64 {
        fade_factor(
            self.fade,
            self.fade_enable_completed,
            self.fade_disable_completed,
            now,
        )
    }

    /// Apply a sparse patch; returns true if any field was actually written
    pub fn apply(&mut self, patch: &ScenePatch) -> bool {
        let mut changed = false;

        if let Some(name) = non_empty(&patch.name) {
            self.name = name;
            changed = true;
        }
        if let Some(color) = non_empty(&patch.color) {
            self.color = color;
            changed = true;
        }
        if let Some(category) = non_empty(&patch.category) {
            self.category = category;
            changed = true;
        }
        if let Some(sort_index) = patch.sort_index {
            self.sort_index = sort_index;
            changed = true;
        }
        if let Some(use_master) = patch.use_master {
            self.use_master = use_master;
            changed = true;
        }
        if let Some(master) = patch.master.and_then(clamp_master) {
            self.master = master;
            changed = true;
        }
        if let Some(fade) = patch.fade {
            if fade.is_finite() && fade >= 0.0 {
                self.fade = fade.round() as u64;
                changed = true;
            }
        }
        match patch.effect_bpm {
            Some(Some(bpm)) if bpm.is_finite() && bpm > 0.0 => {
                self.effect_bpm = Some(bpm);
                changed = true;
            }
            Some(None) => {
                self.effect_bpm = None;
                changed = true;
            }
            _ => {}
        }
        if let Some(effects) = &patch.dmx_effects {
            self.dmx_effects = effects.clone();
            changed = true;
        }
        match &patch.mqtt_toggle_topic {
            Some(Some(topic)) => {
                let topic = topic.trim();
                if !topic.is_empty() {
                    self.mqtt_toggle_topic = Some(topic.to_string());
                    changed = true;
                }
            }
            Some(None) => {
                self.mqtt_toggle_topic = None;
                changed = true;
            }
            None => {}
        }
        if let Some(path) = non_empty(&patch.mqtt_toggle_path) {
            self.mqtt_toggle_path = path;
            changed = true;
        }
        if let Some(value) = non_empty(&patch.mqtt_toggle_value) {
            self.mqtt_toggle_value = value;
            changed = true;
        }

        changed
    }
}

/// Sparse scene update, as sent in `addData` / `updateData`. Absent fields are
/// left untouched.
#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenePatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub category: Option<String>,
    pub sort_index: Option<i64>,
    pub use_master: Option<bool>,
    pub master: Option<f64>,
    pub fade: Option<f64>,
    /// `null` clears the scene-wide effect
    #[serde(default, deserialize_with = "present")]
    pub effect_bpm: Option<Option<f64>>,
    pub dmx_effects: Option<DmxEffects>,
    /// `null` removes the toggle binding
    #[serde(default, deserialize_with = "present")]
    pub mqtt_toggle_topic: Option<Option<String>>,
    pub mqtt_toggle_path: Option<String>,
    pub mqtt_toggle_value: Option<String>,
}

/// Distinguishes an explicit `null` (Some(None)) from an absent field (None)
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn clamp_master(value: f64) -> Option<u8> {
    if value.is_finite() {
        Some(value.round().clamp(0.0, MAX_MASTER as f64) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_trims_and_rejects_empty_strings() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        let patch: ScenePatch =
            serde_json::from_str(r#"{"name":"   ","color":"  #ff0000 "}"#).unwrap();
        assert!(scene.apply(&patch));
        assert_eq!(scene.name, "Wash");
        assert_eq!(scene.color, "#ff0000");
    }

    #[test]
    fn absent_fields_are_untouched() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        scene.effect_bpm = Some(120.0);
        scene.mqtt_toggle_topic = Some("house/lights".into());
        let patch: ScenePatch = serde_json::from_str(r#"{"sortIndex":4}"#).unwrap();
        assert!(scene.apply(&patch));
        assert_eq!(scene.sort_index, 4);
        assert_eq!(scene.effect_bpm, Some(120.0));
        assert_eq!(scene.mqtt_toggle_topic.as_deref(), Some("house/lights"));
    }

    #[test]
    fn explicit_null_clears_optional_fields() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        scene.effect_bpm = Some(120.0);
        scene.mqtt_toggle_topic = Some("house/lights".into());
        let patch: ScenePatch =
            serde_json::from_str(r#"{"effectBpm":null,"mqttToggleTopic":null}"#).unwrap();
        assert!(scene.apply(&patch));
        assert_eq!(scene.effect_bpm, None);
        assert_eq!(scene.mqtt_toggle_topic, None);
    }

    #[test]
    fn master_is_clamped() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        scene.apply(&ScenePatch {
            master: Some(140.0),
            ..ScenePatch::default()
        });
        assert_eq!(scene.master, 100);
        scene.apply(&ScenePatch {
            master: Some(-3.0),
            ..ScenePatch::default()
        });
        assert_eq!(scene.master, 0);
    }

    #[test]
    fn negative_fade_is_ignored() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        let changed = scene.apply(&ScenePatch {
            fade: Some(-10.0),
            ..ScenePatch::default()
        });
        assert!(!changed);
        assert_eq!(scene.fade, 0);
    }

    #[test]
    fn effects_decode_from_json() {
        let patch: ScenePatch = serde_json::from_str(
            r#"{"dmxEffects":{"1":{"3":{"kind":"wave","bpm":60}}}}"#,
        )
        .unwrap();
        let effects = patch.dmx_effects.unwrap();
        assert_eq!(
            effects[&1][&3],
            EffectDescriptor::Wave {
                bpm: 60.0,
                phase: None
            }
        );
    }

    #[test]
    fn master_dimmer_only_when_used() {
        let mut scene = Scene::new("a".into(), "Wash".into(), 0);
        scene.master = 50;
        assert_eq!(scene.master_dimmer(), 1.0);
        scene.use_master = true;
        assert_eq!(scene.master_dimmer(), 0.5);
    }
}
