use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread::{spawn, JoinHandle},
};

use anyhow::Context;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::scene::Scene;

/// One stored scene. DMX data and effects are kept as serialized text
/// columns, decoded back into mappings on load.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneRow {
    pub id: String,
    pub created: i64,
    pub updated: i64,
    pub name: String,
    pub color: String,
    pub category: String,
    pub sort_index: i64,
    pub mqtt_toggle_topic: Option<String>,
    pub mqtt_toggle_path: String,
    pub mqtt_toggle_value: String,
    pub dmx_data: String,
    #[serde(default)]
    pub dmx_effects: String,
    #[serde(default)]
    pub effect_bpm: Option<f64>,
    pub enabled: bool,
    pub master: u8,
    pub use_master: bool,
    pub fade: u64,
    pub fade_enable_completed: i64,
    pub fade_disable_completed: i64,
}

impl TryFrom<&Scene> for SceneRow {
    type Error = serde_json::Error;

    fn try_from(scene: &Scene) -> Result<Self, Self::Error> {
        Ok(SceneRow {
            id: scene.id.clone(),
            created: scene.created,
            updated: scene.updated,
            name: scene.name.clone(),
            color: scene.color.clone(),
            category: scene.category.clone(),
            sort_index: scene.sort_index,
            mqtt_toggle_topic: scene.mqtt_toggle_topic.clone(),
            mqtt_toggle_path: scene.mqtt_toggle_path.clone(),
            mqtt_toggle_value: scene.mqtt_toggle_value.clone(),
            dmx_data: serde_json::to_string(&scene.dmx_data)?,
            dmx_effects: serde_json::to_string(&scene.dmx_effects)?,
            effect_bpm: scene.effect_bpm,
            enabled: scene.enabled,
            master: scene.master,
            use_master: scene.use_master,
            fade: scene.fade,
            fade_enable_completed: scene.fade_enable_completed,
            fade_disable_completed: scene.fade_disable_completed,
        })
    }
}

impl TryFrom<SceneRow> for Scene {
    type Error = serde_json::Error;

    fn try_from(row: SceneRow) -> Result<Self, Self::Error> {
        let dmx_effects = if row.dmx_effects.trim().is_empty() {
            Default::default()
        } else {
            serde_json::from_str(&row.dmx_effects)?
        };
        Ok(Scene {
            dmx_data: serde_json::from_str(&row.dmx_data)?,
            dmx_effects,
            id: row.id,
            created: row.created,
            updated: row.updated,
            name: row.name,
            color: row.color,
            category: row.category,
            sort_index: row.sort_index,
            effect_bpm: row.effect_bpm,
            enabled: row.enabled,
            master: row.master,
            use_master: row.use_master,
            fade: row.fade,
            fade_enable_completed: row.fade_enable_completed,
            fade_disable_completed: row.fade_disable_completed,
            mqtt_toggle_topic: row.mqtt_toggle_topic,
            mqtt_toggle_path: row.mqtt_toggle_path,
            mqtt_toggle_value: row.mqtt_toggle_value,
        })
    }
}

/// Durable scene storage: a bulk replace-all and a full read
pub trait SceneRepository {
    fn load_all(&self) -> anyhow::Result<Vec<Scene>>;
    fn replace_all(&self, scenes: &[Scene]) -> anyhow::Result<()>;
}

/// Scene rows kept as a JSON array in a single file
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileStorage {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SceneRepository for JsonFileStorage {
    fn load_all(&self) -> anyhow::Result<Vec<Scene>> {
        if !self.path.exists() {
            warn!(
                "No scene storage at \"{}\"; starting empty",
                self.path.display()
            );
            return Ok(Vec::new());
        }

        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read \"{}\"", self.path.display()))?;
        let rows = serde_json::from_str::<Vec<SceneRow>>(&text)
            .with_context(|| format!("failed to parse \"{}\"", self.path.display()))?;

        let mut scenes = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Scene::try_from(row) {
                Ok(scene) => scenes.push(scene),
                Err(e) => error!("Skipping stored scene {} with bad DMX data: {}", id, e),
            }
        }
        info!(
            "Loaded {} scenes from \"{}\"",
            scenes.len(),
            self.path.display()
        );
        Ok(scenes)
    }

    fn replace_all(&self, scenes: &[Scene]) -> anyhow::Result<()> {
        let rows = scenes
            .iter()
            .map(SceneRow::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let json = serde_json::to_string_pretty(&rows)?;

        // Write then rename, so a crash never leaves a half-written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write \"{}\"", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace \"{}\"", self.path.display()))?;

        debug!(
            "Saved {} scenes to \"{}\"",
            scenes.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Start a background writer. Each snapshot sent is written as a full
/// replace; snapshots queued behind a slow write are collapsed to the latest.
pub fn start_writer_thread<R>(repository: R) -> (Sender<Vec<Scene>>, JoinHandle<()>)
where
    R: SceneRepository + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = spawn(move || {
        writer_loop(&repository, rx);
        info!("Storage writer: thread loop end");
    });
    (tx, handle)
}

fn writer_loop<R: SceneRepository>(repository: &R, rx: Receiver<Vec<Scene>>) {
    while let Ok(mut scenes) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            scenes = newer;
        }
        if let Err(e) = repository.replace_all(&scenes) {
            error!("Failed to persist scenes: {:#}", e);
        }
    }
}
