use indexmap::IndexMap;
use log::{debug, info};
use uuid::Uuid;

use self::scene::{clamp_master, DmxData, DmxValues, Scene, ScenePatch, UniverseId};

pub mod scene;
pub mod storage;

/// { "scene id": enabled }, in scene order
pub type SceneStatus = IndexMap<String, bool>;

/// Owns every scene. All mutation goes through the methods here; each
/// effective change bumps the touched scene's `updated` stamp and the store
/// revision, which is what change notification keys off.
///
/// Operations naming an unknown scene id are no-ops.
#[derive(Default)]
pub struct SceneStore {
    scenes: Vec<Scene>,
    revision: u64,
}

impl SceneStore {
    pub fn new() -> Self {
        SceneStore::default()
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn get(&self, id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }

    /// Increments on every effective mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn status(&self) -> SceneStatus {
        self.scenes
            .iter()
            .map(|s| (s.id.clone(), s.enabled))
            .collect()
    }

    pub fn enable(&mut self, id: &str, now: i64) {
        self.set_enabled(id, true, now);
    }

    pub fn disable(&mut self, id: &str, now: i64) {
        self.set_enabled(id, false, now);
    }

    pub fn toggle(&mut self, id: &str, now: i64) {
        if let Some(enabled) = self.get(id).map(|s| s.enabled) {
            self.set_enabled(id, !enabled, now);
        }
    }

    fn set_enabled(&mut self, id: &str, enabled: bool, now: i64) {
        let Some(scene) = self.scenes.iter_mut().find(|s| s.id == id) else {
            debug!("No scene \"{}\" to {}", id, if enabled { "enable" } else { "disable" });
            return;
        };
        if scene.enabled == enabled {
            return;
        }

        scene.enabled = enabled;
        if scene.fade > 0 {
            let completed = now + scene.fade as i64;
            if enabled {
                scene.fade_enable_completed = completed;
            } else {
                scene.fade_disable_completed = completed;
            }
        }
        scene.updated = now;
        self.revision += 1;
    }

    pub fn set_master(&mut self, id: &str, value: f64, now: i64) {
        let Some(master) = clamp_master(value) else {
            return;
        };
        self.mutate(id, now, |scene| {
            if scene.master == master {
                return false;
            }
            scene.master = master;
            true
        });
    }

    /// Create a disabled scene with no DMX; returns the new id
    pub fn add(&mut self, name: &str, patch: &ScenePatch, now: i64) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let mut scene = Scene::new(id.clone(), name.to_string(), now);
        scene.apply(patch);

        info!("Added scene \"{}\" ({})", scene.name, id);
        self.scenes.push(scene);
        self.sort();
        self.revision += 1;
        Some(id)
    }

    pub fn update(&mut self, id: &str, patch: &ScenePatch, now: i64) {
        let before = self.revision;
        self.mutate(id, now, |scene| scene.apply(patch));
        if self.revision != before {
            self.sort();
        }
    }

    /// Replace the scene's DMX data wholesale with the given universe snapshots
    pub fn store_dmx(&mut self, id: &str, snapshots: &[(UniverseId, DmxValues)], now: i64) {
        self.mutate(id, now, |scene| {
            let mut dmx_data = DmxData::new();
            for (universe, values) in snapshots {
                dmx_data.insert(*universe, values.clone());
            }
            scene.dmx_data = dmx_data;
            true
        });
    }

    /// Remove each channel whose live value still equals the stored value.
    /// Channels that have since changed are kept.
    pub fn remove_dmx(&mut self, id: &str, snapshots: &[(UniverseId, DmxValues)], now: i64) {
        self.mutate(id, now, |scene| {
            let mut removed = 0;
            for (universe, live) in snapshots {
                let Some(stored) = scene.dmx_data.get_mut(universe) else {
                    continue;
                };
                for (channel, live_value) in live {
                    if stored.get(channel) == Some(live_value) {
                        stored.remove(channel);
                        removed += 1;
                    }
                }
                if stored.is_empty() {
                    scene.dmx_data.remove(universe);
                }
            }
            debug!("Removed {} channels from scene \"{}\"", removed, scene.name);
            removed > 0
        });
    }

    pub fn delete(&mut self, id: &str) {
        let count = self.scenes.len();
        self.scenes.retain(|s| s.id != id);
        if self.scenes.len() != count {
            info!("Deleted scene {}", id);
            self.revision += 1;
        }
    }

    /// Replace the whole store, e.g. after loading from storage
    pub fn reload(&mut self, scenes: Vec<Scene>) {
        self.scenes = scenes;
        self.sort();
        self.revision += 1;
    }

    fn mutate<F>(&mut self, id: &str, now: i64, f: F)
    where
        F: FnOnce(&mut Scene) -> bool,
    {
        if let Some(scene) = self.scenes.iter_mut().find(|s| s.id == id) {
            if f(scene) {
                scene.updated = now;
                self.revision += 1;
            }
        } else {
            debug!("No scene \"{}\"; ignoring", id);
        }
    }

    /// Category first, then sort index within a category
    fn sort(&mut self) {
        self.scenes.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(a.sort_index.cmp(&b.sort_index))
        });
    }
}
