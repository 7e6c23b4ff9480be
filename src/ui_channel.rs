use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        mpsc::{self, Sender, TryRecvError},
        Arc,
    },
    thread::{spawn, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use serde::Serialize;
use tungstenite::{accept, Message};

use crate::{
    model::ModelEvent,
    scenes::{scene::Scene, SceneStatus, SceneStore},
};

/// How long a client thread waits for input before checking for broadcasts
const CLIENT_POLL: Duration = Duration::from_millis(20);

/// Sent to every UI subscriber on connect and after every store change
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SceneBroadcast<'a> {
    pub scenes: &'a [Scene],
    pub scene_status: SceneStatus,
}

impl<'a> From<&'a SceneStore> for SceneBroadcast<'a> {
    fn from(store: &'a SceneStore) -> Self {
        SceneBroadcast {
            scenes: store.scenes(),
            scene_status: store.status(),
        }
    }
}

/// One connected UI client; lines sent here are written by its own thread
pub struct Subscriber {
    pub peer: SocketAddr,
    tx: Sender<Arc<str>>,
}

impl Subscriber {
    pub fn new(peer: SocketAddr, tx: Sender<Arc<str>>) -> Self {
        Subscriber { peer, tx }
    }

    fn send(&self, line: Arc<str>) -> bool {
        self.tx.send(line).is_ok()
    }
}

#[derive(Default)]
pub struct Subscribers {
    list: Vec<Subscriber>,
}

impl Subscribers {
    pub fn new() -> Self {
        Subscribers::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Send the current state to a new subscriber, then keep it
    pub fn welcome(&mut self, subscriber: Subscriber, store: &SceneStore) {
        match encode(store) {
            Some(line) => {
                if subscriber.send(line) {
                    info!("UI subscriber {} connected", subscriber.peer);
                    self.list.push(subscriber);
                }
            }
            None => self.list.push(subscriber),
        }
    }

    /// Send the current state to everyone; disconnected subscribers are dropped
    pub fn broadcast(&mut self, store: &SceneStore) {
        if self.list.is_empty() {
            return;
        }
        let Some(line) = encode(store) else {
            return;
        };
        self.list.retain(|s| {
            let alive = s.send(line.clone());
            if !alive {
                debug!("UI subscriber {} gone", s.peer);
            }
            alive
        });
    }
}

fn encode(store: &SceneStore) -> Option<Arc<str>> {
    match serde_json::to_string(&SceneBroadcast::from(store)) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!("Failed to encode scene broadcast: {}", e);
            None
        }
    }
}

/// Accept WebSocket UI clients. Each text message received is forwarded to
/// the model as a command; broadcasts are written back as text messages.
pub fn start_ui_server(
    listen: SocketAddr,
    tx: Sender<ModelEvent>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener =
        TcpListener::bind(listen).with_context(|| format!("failed to listen on {}", listen))?;
    let local_addr = listener.local_addr()?;
    info!("UI channel listening on ws://{}", local_addr);

    let handle = spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let tx = tx.clone();
                    spawn(move || {
                        if let Err(e) = serve_client(stream, &tx) {
                            warn!("UI client failed: {:#}", e);
                        }
                    });
                }
                Err(e) => warn!("UI accept failed: {}", e),
            }
        }
        info!("UI channel: thread loop end");
    });

    Ok((local_addr, handle))
}

/// One thread per client: flush queued broadcasts, then read with a short
/// timeout so neither direction blocks the other
fn serve_client(stream: TcpStream, tx: &Sender<ModelEvent>) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let mut websocket =
        accept(stream).map_err(|e| anyhow!("websocket handshake with {} failed: {}", peer, e))?;
    websocket
        .get_ref()
        .set_read_timeout(Some(CLIENT_POLL))?;

    let (line_tx, line_rx) = mpsc::channel::<Arc<str>>();
    tx.send(ModelEvent::UiConnected(Subscriber::new(peer, line_tx)))
        .map_err(|_| anyhow!("model loop has stopped"))?;

    loop {
        loop {
            match line_rx.try_recv() {
                Ok(line) => websocket.send(Message::Text(line.to_string()))?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    websocket.close(None)?;
                    return Ok(());
                }
            }
        }

        match websocket.read() {
            Ok(Message::Text(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                if tx.send(ModelEvent::UiCommand(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("UI subscriber {} closing", peer);
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!("UI subscriber {} disconnected", peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::scenes::scene::ScenePatch;

    fn subscriber() -> (Subscriber, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel();
        (Subscriber::new(SocketAddr::from(([127, 0, 0, 1], 1)), tx), rx)
    }

    #[test]
    fn broadcast_shape() {
        let mut store = SceneStore::new();
        let id = store.add("Wash", &ScenePatch::default(), 0).unwrap();
        let json = serde_json::to_value(SceneBroadcast::from(&store)).unwrap();
        assert_eq!(json["scenes"][0]["name"], "Wash");
        assert_eq!(json["scenes"][0]["sortIndex"], 0);
        assert_eq!(json["sceneStatus"][&id], Value::Bool(false));
    }

    #[test]
    fn welcome_then_broadcast() {
        let mut store = SceneStore::new();
        let mut subscribers = Subscribers::new();
        let (sub, rx) = subscriber();
        subscribers.welcome(sub, &store);
        assert!(rx.try_recv().unwrap().contains("\"scenes\":[]"));

        store.add("Wash", &ScenePatch::default(), 0);
        subscribers.broadcast(&store);
        assert!(rx.try_recv().unwrap().contains("Wash"));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let store = SceneStore::new();
        let mut subscribers = Subscribers::new();
        let (alive, _keep) = subscriber();
        let (dead, rx) = subscriber();
        subscribers.welcome(alive, &store);
        subscribers.welcome(dead, &store);
        drop(rx);
        subscribers.broadcast(&store);
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn websocket_client_round_trip() {
        let (tx, rx) = mpsc::channel();
        let (addr, _handle) =
            start_ui_server(SocketAddr::from(([127, 0, 0, 1], 0)), tx).unwrap();

        let (mut client, response) = tungstenite::connect(format!("ws://{}", addr)).unwrap();
        assert_eq!(response.status().as_u16(), 101);

        let subscriber = match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ModelEvent::UiConnected(subscriber) => subscriber,
            _ => panic!("expected a connection event"),
        };
        let mut store = SceneStore::new();
        store.add("Wash", &ScenePatch::default(), 0);
        let mut subscribers = Subscribers::new();
        subscribers.welcome(subscriber, &store);

        match client.read().unwrap() {
            Message::Text(text) => {
                let json: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["scenes"][0]["name"], "Wash");
            }
            other => panic!("unexpected {:?}", other),
        }

        let command = r#"{"type":"toggle","sceneId":"a"}"#;
        client.send(Message::Text(command.to_string())).unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ModelEvent::UiCommand(text) => assert_eq!(text, command),
            _ => panic!("expected a command event"),
        }
    }
}
