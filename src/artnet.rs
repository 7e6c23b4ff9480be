use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::{anyhow, Context};
use artnet_protocol::{ArtCommand, Output};

use crate::{output::DmxTransmitter, scenes::scene::UniverseId};

/// Alternate output over Art-Net. Art-Net carries neither priority nor a
/// source name, so both are dropped on the wire.
pub struct ArtNetInterface {
    socket: UdpSocket,
    destination: SocketAddr,
}

pub enum ArtNetMode {
    Broadcast,
    /// Specify from (interface) + to (destination) addresses
    Unicast(SocketAddr, SocketAddr),
}

impl ArtNetInterface {
    pub fn new(mode: ArtNetMode) -> anyhow::Result<Self> {
        match mode {
            ArtNetMode::Broadcast => {
                let socket = UdpSocket::bind((String::from("0.0.0.0"), 6455))
                    .context("failed to bind ArtNet socket")?;
                let broadcast_addr = ("255.255.255.255", 6454)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| anyhow!("no broadcast address"))?;
                socket.set_broadcast(true)?;
                Ok(ArtNetInterface {
                    socket,
                    destination: broadcast_addr,
                })
            }
            ArtNetMode::Unicast(src, destination) => {
                let socket = UdpSocket::bind(src)
                    .with_context(|| format!("failed to bind ArtNet socket on {}", src))?;
                socket.set_broadcast(false)?;
                Ok(ArtNetInterface {
                    socket,
                    destination,
                })
            }
        }
    }
}

impl DmxTransmitter for ArtNetInterface {
    fn transmit(
        &mut self,
        universe: UniverseId,
        slots: &[u8],
        _priority: u8,
        _source_name: &str,
    ) -> anyhow::Result<()> {
        let port_address = universe
            .try_into()
            .map_err(|e| anyhow!("invalid ArtNet port address {}: {:?}", universe, e))?;
        let command = ArtCommand::Output(Output {
            port_address,
            data: slots.to_vec().into(),
            ..Output::default()
        });

        let buff = command
            .write_to_buffer()
            .map_err(|e| anyhow!("failed to encode ArtNet output: {:?}", e))?;
        self.socket.send_to(&buff, self.destination)?;
        Ok(())
    }
}
