use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Parser, ValueEnum};

const UNICAST_SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 102));
const UNICAST_DST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const SACN_INTERFACE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

pub const DEFAULT_SOURCE_NAME: &str = "sACN Scene Recorder";

pub const DEFAULT_OUTPUT_PERIOD_MS: u64 = 65;

pub const CHANNELS_PER_UNIVERSE: u16 = 512;

/// Highest priority allowed by sACN
pub const MAX_PRIORITY: u8 = 200;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Sacn,
    Artnet,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = "sACN Scene Recorder")]
pub struct Cli {
    #[arg(long = "loglevel",default_value_t=String::from("info"))]
    pub log_level: String,

    /// Universes to listen on and transmit to
    #[arg(long = "universes", value_delimiter = ',', default_values_t = vec![1u16, 2, 3, 4])]
    pub universes: Vec<u16>,

    /// Source name used when transmitting; frames carrying this name are
    /// treated as our own echo and ignored
    #[arg(long = "sourceName", default_value_t=String::from(DEFAULT_SOURCE_NAME))]
    pub source_name: String,

    /// Transmit priority, 0-200
    #[arg(long = "priority", default_value_t = 90)]
    pub priority: u8,

    /// Output loop period, in milliseconds
    #[arg(long = "output.periodMs", default_value_t=DEFAULT_OUTPUT_PERIOD_MS)]
    pub output_period_ms: u64,

    #[arg(long = "output.mode", value_enum, default_value_t=OutputMode::Sacn)]
    pub output_mode: OutputMode,

    /// Flag to start with output stopped (input is still tracked)
    #[arg(long = "output.paused")]
    pub output_paused: bool,

    /// Flag to merge (HTP) the live input into the output
    #[arg(long = "output.passthrough")]
    pub output_passthrough: bool,

    /// IPv4 interface for sACN multicast
    #[arg(long = "sacn.interface", default_value_t=SACN_INTERFACE)]
    pub sacn_interface: Ipv4Addr,

    /// Flag to enable ArtNet broadcast mode (only with output.mode=artnet)
    #[arg(long = "artnet.broadcast")]
    pub artnet_broadcast: bool,

    /// IP address for ArtNet source interface (ignored if broadcast enabled)
    #[arg(long = "artnet.interface", default_value_t=UNICAST_SRC)]
    pub unicast_src: IpAddr,

    /// IP address for ArtNet destination node (ignored if broadcast enabled)
    #[arg(long = "artnet.destination", default_value_t=UNICAST_DST)]
    pub unicast_dst: IpAddr,

    /// Path of the scene storage file
    #[arg(long = "storage", default_value_t=String::from("./scenes.json"))]
    pub storage_path: String,

    /// Address for the UI-facing JSON channel
    #[arg(long = "ui.listen", default_value_t=SocketAddr::from(([0, 0, 0, 0], 8080)))]
    pub ui_listen: SocketAddr,

    /// Flag to disable the Tether (MQTT) automation bus
    #[arg(long = "tether.disable")]
    pub tether_disable: bool,

    #[arg(long = "tether.host")]
    pub tether_host: Option<String>,

    #[arg(long = "tether.role", default_value_t=String::from("sceneRecorder"))]
    pub tether_role: String,

    #[arg(long = "tether.id")]
    pub tether_id: Option<String>,

    /// Topic used for bus commands and status replies
    #[arg(long = "tether.topic", default_value_t=String::from("sacn-scene-recorder"))]
    pub tether_topic: String,

    /// Identifies our own bus messages; inbound messages with this id are ignored
    #[arg(long = "tether.sourceId", default_value_t=String::from("sacn-scene-recorder"))]
    pub tether_source_id: String,

    /// Coalescing window for status pushes to the bus
    #[arg(long = "debounceMs", default_value_t = 1000)]
    pub debounce_ms: u64,
}

impl Cli {
    pub fn transmit_priority(&self) -> u8 {
        self.priority.min(MAX_PRIORITY)
    }
}
