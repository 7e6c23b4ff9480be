use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{sleep, spawn, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_agent::{PlugDefinition, PlugOptionsBuilder, TetherAgent, TetherAgentOptionsBuilder};

use crate::{
    model::ModelEvent,
    scenes::{scene::Scene, SceneStatus, SceneStore},
};

pub const SOURCE_ID_FIELD: &str = "source-id";

const BUS_ENABLE_MASTER: f64 = 100.0;
const BUS_DISABLE_MASTER: f64 = 1.0;

/// Command on the bus command topic
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BusCommand {
    #[serde(rename = "source-id", default)]
    pub source_id: Option<String>,
    pub command: String,
    #[serde(rename = "sceneId", default)]
    pub scene_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub scene_status: SceneStatus,
}

/// Status reply / push
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BusStatus {
    #[serde(rename = "source-id")]
    pub source_id: String,
    pub status: StatusBody,
}

/// Inbound from the bus, already filtered for our own echoes
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Command(BusCommand),
    Toggle { topic: String, payload: Value },
}

/// Outbound to the bus thread
#[derive(Debug, Clone, PartialEq)]
pub enum BusRequest {
    PublishStatus(SceneStatus),
    /// The full set of per-scene toggle topics currently configured
    WatchToggleTopics(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct TetherSettings {
    pub host: Option<String>,
    pub role: String,
    pub id: Option<String>,
    pub topic: String,
    pub source_id: String,
}

/// Decode a bus payload. Tether agents send MessagePack; other publishers on
/// toggle topics often send JSON, so that is tried first.
pub fn decode_payload(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .or_else(|| rmp_serde::from_slice::<Value>(bytes).ok())
}

pub fn is_own_message(payload: &Value, source_id: &str) -> bool {
    payload.get(SOURCE_ID_FIELD).and_then(Value::as_str) == Some(source_id)
}

/// Field lookup for toggle bindings: an exact key, otherwise a dotted path
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    payload.get(path).or_else(|| {
        path.split('.')
            .try_fold(payload, |value, key| value.get(key))
    })
}

fn matches_value(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(_) | Value::Bool(_) => value.to_string() == expected,
        _ => false,
    }
}

/// Whether a message on `topic` should toggle this scene
pub fn toggle_matches(scene: &Scene, topic: &str, payload: &Value) -> bool {
    scene.mqtt_toggle_topic.as_deref() == Some(topic)
        && !scene.mqtt_toggle_path.is_empty()
        && lookup(payload, &scene.mqtt_toggle_path)
            .is_some_and(|v| matches_value(v, &scene.mqtt_toggle_value))
}

/// Distinct toggle topics across all scenes
pub fn toggle_topics(scenes: &[Scene]) -> Vec<String> {
    let mut topics: Vec<String> = scenes
        .iter()
        .filter_map(|s| s.mqtt_toggle_topic.clone())
        .collect();
    topics.sort();
    topics.dedup();
    topics
}

/// Apply a bus message to the store. Returns true if a status reply should
/// go out straight away.
pub fn handle_bus_message(message: BusMessage, store: &mut SceneStore, now: i64) -> bool {
    match message {
        BusMessage::Command(command) => match command.command.as_str() {
            "status" => true,
            "enable" | "disable" => {
                let Some(scene_id) = command.scene_id else {
                    warn!("Bus \"{}\" without sceneId; dropped", command.command);
                    return false;
                };
                // bus switches also bring the fader to full, or nearly off
                if command.command == "enable" {
                    store.enable(&scene_id, now);
                    store.set_master(&scene_id, BUS_ENABLE_MASTER, now);
                } else {
                    store.disable(&scene_id, now);
                    store.set_master(&scene_id, BUS_DISABLE_MASTER, now);
                }
                info!("Bus {} {}", command.command, scene_id);
                true
            }
            other => {
                warn!("Unknown bus command \"{}\"; dropped", other);
                false
            }
        },
        BusMessage::Toggle { topic, payload } => {
            let ids: Vec<String> = store
                .scenes()
                .iter()
                .filter(|s| toggle_matches(s, &topic, &payload))
                .map(|s| s.id.clone())
                .collect();
            for id in &ids {
                debug!("Toggle scene {} from topic \"{}\"", id, topic);
                store.toggle(id, now);
            }
            !ids.is_empty()
        }
    }
}

/// Connect to the bus and pump messages both ways until the request channel
/// closes. Connection failures are logged; the rest of the system carries on
/// without the bus.
pub fn start_tether_thread(
    settings: TetherSettings,
    tx: Sender<ModelEvent>,
) -> (Sender<BusRequest>, JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel();

    let handle = spawn(move || {
        if let Err(e) = run_tether(&settings, &tx, request_rx) {
            error!("Tether Interface stopped: {:#}", e);
        }
        info!("Tether Interface: Thread loop end");
    });

    (request_tx, handle)
}

fn run_tether(
    settings: &TetherSettings,
    tx: &Sender<ModelEvent>,
    requests: Receiver<BusRequest>,
) -> anyhow::Result<()> {
    info!("Attempt to connect Tether Agent...");

    let mut tether_agent = TetherAgentOptionsBuilder::new(&settings.role)
        .id(settings.id.as_deref())
        .host(settings.host.as_deref())
        .build()?;

    let input_commands = PlugOptionsBuilder::create_input("commands")
        .topic(Some(settings.topic.as_str()))
        .build(&mut tether_agent)?;
    let output_status = PlugOptionsBuilder::create_output("status")
        .topic(Some(settings.topic.as_str()))
        .build(&mut tether_agent)?;

    info!("Tether Agent connected; commands on \"{}\"", settings.topic);

    let mut toggle_inputs: HashMap<String, PlugDefinition> = HashMap::new();

    loop {
        while let Some((topic, message)) = tether_agent.check_messages() {
            let is_command = input_commands.matches(&topic);
            let toggle_topic = toggle_inputs
                .iter()
                .find(|(_, plug)| plug.matches(&topic))
                .map(|(t, _)| t.clone());
            if !is_command && toggle_topic.is_none() {
                continue;
            }

            let Some(payload) = decode_payload(&message) else {
                warn!("Undecodable bus payload; dropped");
                continue;
            };
            if is_own_message(&payload, &settings.source_id) {
                continue;
            }

            let forwarded = if is_command {
                match serde_json::from_value::<BusCommand>(payload) {
                    Ok(command) => tx.send(ModelEvent::Bus(BusMessage::Command(command))),
                    Err(e) => {
                        warn!("Invalid bus command: {}", e);
                        Ok(())
                    }
                }
            } else if let Some(topic) = toggle_topic {
                tx.send(ModelEvent::Bus(BusMessage::Toggle { topic, payload }))
            } else {
                Ok(())
            };
            if forwarded.is_err() {
                return Ok(());
            }
        }

        loop {
            match requests.try_recv() {
                Ok(BusRequest::PublishStatus(scene_status)) => {
                    let status = BusStatus {
                        source_id: settings.source_id.clone(),
                        status: StatusBody { scene_status },
                    };
                    let payload = rmp_serde::to_vec_named(&status)?;
                    if let Err(e) = tether_agent.publish(&output_status, Some(&payload)) {
                        error!("Failed to publish status: {}", e);
                    }
                }
                Ok(BusRequest::WatchToggleTopics(topics)) => {
                    watch_toggle_topics(&mut tether_agent, &mut toggle_inputs, topics);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }

        sleep(Duration::from_millis(1));
    }
}

fn watch_toggle_topics(
    tether_agent: &mut TetherAgent,
    toggle_inputs: &mut HashMap<String, PlugDefinition>,
    topics: Vec<String>,
) {
    // Subscriptions are never dropped; stale topics simply match no scene
    for topic in topics {
        if toggle_inputs.contains_key(&topic) {
            continue;
        }
        let name = format!("toggle{}", toggle_inputs.len());
        match PlugOptionsBuilder::create_input(&name)
            .topic(Some(topic.as_str()))
            .build(tether_agent)
        {
            Ok(plug) => {
                debug!("Watching toggle topic \"{}\"", topic);
                toggle_inputs.insert(topic, plug);
            }
            Err(e) => error!("Failed to subscribe to \"{}\": {}", topic, e),
        }
    }
}
