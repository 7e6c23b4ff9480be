//! sACN (E1.31) transport. Output goes through the `sacn` crate's source;
//! input is read from the multicast groups and parsed with its packet parser,
//! so the source name and priority of every packet stay visible to the
//! live input tracker.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::mpsc::Sender,
    thread::{spawn, JoinHandle},
};

use anyhow::{anyhow, Context};
use log::{debug, error, info, trace};
use sacn::{
    packet::{AcnRootLayerProtocol, E131RootLayerData},
    source::SacnSource,
};
use thiserror::Error;

use crate::{
    live_input::DmxFrame,
    model::ModelEvent,
    output::DmxTransmitter,
    scenes::scene::{DmxValues, UniverseId},
    settings::CHANNELS_PER_UNIVERSE,
};

pub const SACN_PORT: u16 = 5568;

const DMX_START_CODE: u8 = 0;

#[derive(Error, Debug, PartialEq)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("not a data packet")]
    NotData,
    #[error("no slots")]
    Empty,
    #[error("unsupported start code {0:#x}")]
    UnsupportedStartCode(u8),
    #[error("preview data")]
    Preview,
    #[error("stream terminated")]
    Terminated,
}

/// Multicast group for a universe, 239.255.hi.lo
pub fn multicast_group(universe: UniverseId) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Parse a received datagram into a frame; zero-valued slots are not included
pub fn decode_frame(buf: &[u8]) -> Result<DmxFrame, PacketError> {
    let packet = AcnRootLayerProtocol::parse(buf)
        .map_err(|e| PacketError::Malformed(format!("{:?}", e)))?;
    let E131RootLayerData::DataPacket(data) = packet.pdu.data else {
        return Err(PacketError::NotData);
    };
    if data.preview_data {
        return Err(PacketError::Preview);
    }
    if data.stream_terminated {
        return Err(PacketError::Terminated);
    }

    let values: &[u8] = &data.data.property_values;
    let Some((start_code, slots)) = values.split_first() else {
        return Err(PacketError::Empty);
    };
    if *start_code != DMX_START_CODE {
        return Err(PacketError::UnsupportedStartCode(*start_code));
    }

    let payload: DmxValues = slots
        .iter()
        .take(CHANNELS_PER_UNIVERSE as usize)
        .enumerate()
        .filter(|(_, value)| **value > 0)
        .map(|(i, value)| (i as u16 + 1, *value))
        .collect();

    Ok(DmxFrame {
        universe: data.universe,
        priority: data.priority,
        source_name: data.source_name.to_string(),
        payload,
    })
}

/// Sends our mix as an sACN source. The source name is fixed when the
/// source is created; priority is set per packet.
pub struct SacnTransmitter {
    source: SacnSource,
    registered: HashSet<UniverseId>,
}

impl SacnTransmitter {
    pub fn new(interface: Ipv4Addr, source_name: &str) -> anyhow::Result<Self> {
        let source = SacnSource::with_ip(source_name, SocketAddr::from((interface, 0)))
            .map_err(|e| anyhow!("failed to create sACN source on {}: {:?}", interface, e))?;
        info!("sACN source \"{}\" on {}", source_name, interface);
        Ok(SacnTransmitter {
            source,
            registered: HashSet::new(),
        })
    }

    fn register(&mut self, universe: UniverseId) -> anyhow::Result<()> {
        if self.registered.contains(&universe) {
            return Ok(());
        }
        self.source
            .register_universe(universe)
            .map_err(|e| anyhow!("failed to register universe {}: {:?}", universe, e))?;
        debug!("Registered sACN universe {}", universe);
        self.registered.insert(universe);
        Ok(())
    }
}

impl DmxTransmitter for SacnTransmitter {
    fn transmit(
        &mut self,
        universe: UniverseId,
        slots: &[u8],
        priority: u8,
        _source_name: &str,
    ) -> anyhow::Result<()> {
        self.register(universe)?;

        let mut data = Vec::with_capacity(slots.len() + 1);
        data.push(DMX_START_CODE);
        data.extend_from_slice(slots);

        self.source
            .send(&[universe], &data, Some(priority), None, None)
            .map_err(|e| anyhow!("failed to send universe {}: {:?}", universe, e))
    }
}

/// Listen for sACN on the given universes, forwarding every decoded frame
/// to the model. Arbitration happens in the model, not here.
pub fn start_receiver_thread(
    interface: Ipv4Addr,
    universes: &[UniverseId],
    tx: Sender<ModelEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SACN_PORT))
        .context("failed to bind sACN receive socket")?;
    for universe in universes {
        socket
            .join_multicast_v4(&multicast_group(*universe), &interface)
            .with_context(|| format!("failed to join multicast for universe {}", universe))?;
    }
    info!("Listening for sACN on universes {:?}", universes);

    Ok(spawn(move || {
        let mut buf = [0u8; 1144];
        loop {
            let len = match socket.recv_from(&mut buf) {
                Ok((len, _from)) => len,
                Err(e) => {
                    error!("sACN receive failed: {}", e);
                    continue;
                }
            };
            match decode_frame(&buf[..len]) {
                Ok(frame) => {
                    if tx.send(ModelEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(PacketError::Preview) | Err(PacketError::Terminated) => {
                    trace!("Skip sACN packet");
                }
                Err(e) => debug!("Ignore sACN packet: {}", e),
            }
        }
        info!("sACN receiver: thread loop end");
    }))
}
