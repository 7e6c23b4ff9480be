use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    live_input::LiveInputTracker,
    scenes::{
        scene::{ScenePatch, UniverseId},
        SceneStore,
    },
};

/// Wire shape of a UI command: a `type` tag plus whichever fields that tag
/// needs
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CommandMessage {
    #[serde(rename = "type")]
    kind: CommandKind,
    scene_id: Option<String>,
    add_data: Option<ScenePatch>,
    #[serde(alias = "metadata")]
    update_data: Option<ScenePatch>,
    universes: Option<Vec<UniverseId>>,
    value: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
enum CommandKind {
    Enable,
    Disable,
    Toggle,
    Add,
    Update,
    Delete,
    StoreDmx,
    RemoveDmx,
    Master,
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enable { scene_id: String },
    Disable { scene_id: String },
    Toggle { scene_id: String },
    Add { add_data: ScenePatch },
    Update {
        scene_id: String,
        update_data: ScenePatch,
    },
    Delete { scene_id: String },
    StoreDmx {
        scene_id: String,
        universes: Vec<UniverseId>,
    },
    RemoveDmx {
        scene_id: String,
        universes: Vec<UniverseId>,
    },
    Master { scene_id: String, value: f64 },
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} command is missing {1}")]
    MissingField(&'static str, &'static str),
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

fn required<T>(value: Option<T>, kind: &'static str, field: &'static str) -> Result<T, CommandError> {
    value.ok_or(CommandError::MissingField(kind, field))
}

impl TryFrom<CommandMessage> for Command {
    type Error = CommandError;

    fn try_from(m: CommandMessage) -> Result<Self, Self::Error> {
        let command = match m.kind {
            CommandKind::Enable => Command::Enable {
                scene_id: required(m.scene_id, "enable", "sceneId")?,
            },
            CommandKind::Disable => Command::Disable {
                scene_id: required(m.scene_id, "disable", "sceneId")?,
            },
            CommandKind::Toggle => Command::Toggle {
                scene_id: required(m.scene_id, "toggle", "sceneId")?,
            },
            CommandKind::Add => {
                let add_data = required(m.add_data, "add", "addData")?;
                let has_name = add_data
                    .name
                    .as_deref()
                    .is_some_and(|n| !n.trim().is_empty());
                if !has_name {
                    return Err(CommandError::InvalidValue {
                        field: "addData.name",
                        reason: "required",
                    });
                }
                Command::Add { add_data }
            }
            CommandKind::Update => Command::Update {
                scene_id: required(m.scene_id, "update", "sceneId")?,
                update_data: required(m.update_data, "update", "updateData")?,
            },
            CommandKind::Delete => Command::Delete {
                scene_id: required(m.scene_id, "delete", "sceneId")?,
            },
            CommandKind::StoreDmx => Command::StoreDmx {
                scene_id: required(m.scene_id, "storeDmx", "sceneId")?,
                universes: required(m.universes, "storeDmx", "universes")?,
            },
            CommandKind::RemoveDmx => Command::RemoveDmx {
                scene_id: required(m.scene_id, "removeDmx", "sceneId")?,
                universes: required(m.universes, "removeDmx", "universes")?,
            },
            CommandKind::Master => {
                let value = required(m.value, "master", "value")?;
                if !value.is_finite() {
                    return Err(CommandError::InvalidValue {
                        field: "value",
                        reason: "not a number",
                    });
                }
                Command::Master {
                    scene_id: required(m.scene_id, "master", "sceneId")?,
                    value,
                }
            }
        };
        Ok(command)
    }
}

impl Command {
    pub fn decode(text: &str) -> Result<Command, CommandError> {
        let message = serde_json::from_str::<CommandMessage>(text)?;
        Command::try_from(message)
    }
}

/// Decode and apply one command. Rejected commands are logged and leave the
/// store untouched.
pub fn handle_command(text: &str, store: &mut SceneStore, live_input: &LiveInputTracker, now: i64) {
    match Command::decode(text) {
        Ok(command) => apply_command(command, store, live_input, now),
        Err(e) => warn!("Dropped command: {}", e),
    }
}

pub fn apply_command(
    command: Command,
    store: &mut SceneStore,
    live_input: &LiveInputTracker,
    now: i64,
) {
    debug!("Apply {:?}", command);
    match command {
        Command::Enable { scene_id } => store.enable(&scene_id, now),
        Command::Disable { scene_id } => store.disable(&scene_id, now),
        Command::Toggle { scene_id } => store.toggle(&scene_id, now),
        Command::Add { add_data } => {
            let name = add_data.name.clone().unwrap_or_default();
            store.add(&name, &add_data, now);
        }
        Command::Update {
            scene_id,
            update_data,
        } => store.update(&scene_id, &update_data, now),
        Command::Delete { scene_id } => store.delete(&scene_id),
        Command::StoreDmx {
            scene_id,
            universes,
        } => {
            let snapshots = live_input.payloads(&universes);
            store.store_dmx(&scene_id, &snapshots, now);
        }
        Command::RemoveDmx {
            scene_id,
            universes,
        } => {
            let snapshots = live_input.payloads(&universes);
            store.remove_dmx(&scene_id, &snapshots, now);
        }
        Command::Master { scene_id, value } => store.set_master(&scene_id, value, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{live_input::DmxFrame, mixer::mix_universe, scenes::scene::DmxValues};

    fn live(universe: u16, values: &[(u16, u8)]) -> LiveInputTracker {
        let mut tracker = LiveInputTracker::new(&[1, 2, 3, 4], "Recorder");
        tracker.receive(
            DmxFrame {
                universe,
                priority: 100,
                source_name: "desk".into(),
                payload: values.iter().copied().collect(),
            },
            0,
        );
        tracker
    }

    #[test]
    fn decodes_every_tag() {
        let cases = [
            r#"{"type":"enable","sceneId":"a"}"#,
            r#"{"type":"disable","sceneId":"a"}"#,
            r#"{"type":"toggle","sceneId":"a"}"#,
            r##"{"type":"add","addData":{"name":"Wash","color":"#fff","category":"FOH","sortIndex":1}}"##,
            r#"{"type":"update","sceneId":"a","updateData":{"fade":500}}"#,
            r#"{"type":"update","sceneId":"a","updateData":{"dmxEffects":{"1":{"2":{"kind":"wave","bpm":120}}}}}"#,
            r#"{"type":"delete","sceneId":"a"}"#,
            r#"{"type":"storeDmx","sceneId":"a","universes":[1,2]}"#,
            r#"{"type":"removeDmx","sceneId":"a","universes":[1]}"#,
            r#"{"type":"master","sceneId":"a","value":55}"#,
        ];
        for case in cases {
            assert!(Command::decode(case).is_ok(), "{}", case);
        }
        assert_eq!(
            Command::decode(r#"{"type":"storeDmx","sceneId":"a","universes":[1,2]}"#).unwrap(),
            Command::StoreDmx {
                scene_id: "a".into(),
                universes: vec![1, 2]
            }
        );
    }

    #[test]
    fn update_accepts_metadata_field() {
        let command =
            Command::decode(r##"{"type":"update","sceneId":"a","metadata":{"name":"X","color":"#000"}}"##)
                .unwrap();
        match command {
            Command::Update {
                scene_id,
                update_data,
            } => {
                assert_eq!(scene_id, "a");
                assert_eq!(update_data.name.as_deref(), Some("X"));
                assert_eq!(update_data.color.as_deref(), Some("#000"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_and_incomplete() {
        let cases = [
            "not json",
            r#"{"type":"explode","sceneId":"a"}"#,
            r#"{"type":"enable"}"#,
            r#"{"type":"storeDmx","sceneId":"a"}"#,
            r#"{"type":"master","sceneId":"a"}"#,
            r#"{"type":"add"}"#,
            r#"{"type":"add","addData":{"name":"  "}}"#,
        ];
        for case in cases {
            assert!(Command::decode(case).is_err(), "{}", case);
        }
    }

    #[test]
    fn rejected_command_leaves_store_untouched() {
        let mut store = SceneStore::new();
        let tracker = live(1, &[]);
        handle_command(r#"{"type":"add","addData":{"color":"red"}}"#, &mut store, &tracker, 0);
        assert!(store.scenes().is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn record_and_replay() {
        let mut store = SceneStore::new();
        let tracker = live(1, &[(1, 255), (2, 128)]);

        handle_command(
            r##"{"type":"add","addData":{"name":"Wash","color":"#ffffff","category":"FOH","sortIndex":10}}"##,
            &mut store,
            &tracker,
            1000,
        );
        let scene = &store.scenes()[0];
        assert!(!scene.enabled);
        assert!(scene.dmx_data.is_empty());
        assert_eq!(scene.color, "#ffffff");
        let id = scene.id.clone();

        handle_command(
            &format!(r#"{{"type":"storeDmx","sceneId":"{}","universes":[1]}}"#, id),
            &mut store,
            &tracker,
            2000,
        );
        let stored = &store.get(&id).unwrap().dmx_data;
        assert_eq!(stored[&1], [(1, 255), (2, 128)].into_iter().collect::<DmxValues>());

        handle_command(
            &format!(r#"{{"type":"enable","sceneId":"{}"}}"#, id),
            &mut store,
            &tracker,
            3000,
        );
        let out = mix_universe(store.scenes(), None, 1, 3000);
        assert_eq!(out[&1], 255.0);
        assert_eq!(out[&2], 128.0);
    }

    #[test]
    fn remove_dmx_reads_live_input() {
        let mut store = SceneStore::new();
        let id = store.add("Wash", &ScenePatch::default(), 0).unwrap();
        store.store_dmx(&id, &[(1, [(1, 50)].into_iter().collect())], 0);

        let changed = live(1, &[(1, 75)]);
        apply_command(
            Command::RemoveDmx {
                scene_id: id.clone(),
                universes: vec![1],
            },
            &mut store,
            &changed,
            1,
        );
        assert_eq!(store.get(&id).unwrap().dmx_data[&1][&1], 50);

        let same = live(1, &[(1, 50)]);
        apply_command(
            Command::RemoveDmx {
                scene_id: id.clone(),
                universes: vec![1],
            },
            &mut store,
            &same,
            2,
        );
        assert!(store.get(&id).unwrap().dmx_data.is_empty());
    }

    #[test]
    fn master_command_clamps() {
        let mut store = SceneStore::new();
        let tracker = live(1, &[]);
        let id = store.add("Wash", &ScenePatch::default(), 0).unwrap();
        handle_command(
            &format!(r#"{{"type":"master","sceneId":"{}","value":250}}"#, id),
            &mut store,
            &tracker,
            1,
        );
        assert_eq!(store.get(&id).unwrap().master, 100);
        handle_command(
            &format!(r#"{{"type":"master","sceneId":"{}","value":33.4}}"#, id),
            &mut store,
            &tracker,
            2,
        );
        assert_eq!(store.get(&id).unwrap().master, 33);
    }
}
