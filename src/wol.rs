//! Wake-on-LAN magic packet sender.
//!
//! A magic packet is 6 bytes of `0xFF` followed by the target MAC repeated
//! 16 times, sent as a UDP broadcast. TVs register up to two hardware
//! addresses (wired and wireless), so the sender fires one packet per
//! configured address. Sending is strictly best effort: failures are logged
//! and never surfaced to callers.

use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::TvConfig;

/// Default UDP port for wake-on-LAN (the "discard" port).
pub const DEFAULT_WOL_PORT: u16 = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WolError {
    #[error("invalid hardware address: {0}")]
    InvalidMac(String),
}

/// Parses a MAC address in colon, dash or bare-hex notation.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], WolError> {
    let cleaned: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    if cleaned.len() != 12 {
        return Err(WolError::InvalidMac(mac.to_string()));
    }
    let mut bytes = [0u8; 6];
    for (i, chunk) in cleaned.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|_| WolError::InvalidMac(mac.to_string()))?;
        bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| WolError::InvalidMac(mac.to_string()))?;
    }
    Ok(bytes)
}

/// Builds the 102-byte magic packet for one hardware address.
pub fn magic_packet(mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(102);
    packet.extend_from_slice(&[0xFF; 6]);
    for _ in 0..16 {
        packet.extend_from_slice(mac);
    }
    packet
}

/// Something that can nudge a sleeping TV awake.
///
/// Trait seam so the supervisor's wake calls can be observed in tests
/// without touching the network.
pub trait WakeSender: Send + Sync {
    fn wake(&self, config: &TvConfig);
}

/// Sends magic packets over a broadcast UDP socket.
#[derive(Debug, Default)]
pub struct UdpWakeSender;

impl UdpWakeSender {
    fn send_packet(&self, config: &TvConfig, mac: &str) -> std::io::Result<()> {
        let bytes = match parse_mac(mac) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("[{}] not waking: {}", config.address, err);
                return Ok(());
            }
        };
        let broadcast = config
            .broadcast
            .as_deref()
            .and_then(|b| b.parse::<Ipv4Addr>().ok())
            .unwrap_or(Ipv4Addr::BROADCAST);
        let port = config.wol_port.unwrap_or(DEFAULT_WOL_PORT);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        let bind_addr = config
            .interface
            .as_deref()
            .and_then(|i| i.parse::<Ipv4Addr>().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.bind(&SocketAddrV4::new(bind_addr, 0).into())?;

        let dest = SocketAddrV4::new(broadcast, port);
        socket.send_to(&magic_packet(&bytes), &dest.into())?;
        log::debug!("[{}] sent magic packet for {} to {}", config.address, mac, dest);
        Ok(())
    }
}

impl WakeSender for UdpWakeSender {
    fn wake(&self, config: &TvConfig) {
        let macs = [config.mac_address.as_deref(), config.mac_address2.as_deref()];
        let mut sent_any = false;
        for mac in macs.into_iter().flatten() {
            sent_any = true;
            if let Err(err) = self.send_packet(config, mac) {
                log::warn!("[{}] magic packet for {} failed: {}", config.address, mac, err);
            }
        }
        if !sent_any {
            log::warn!("[{}] cannot wake: no hardware address known", config.address);
        }
    }
}
