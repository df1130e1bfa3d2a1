//! Fixed-layout SPV status datagrams.
//!
//! All fields are network byte order. A ping is 69 bytes: magic, protocol
//! version, 64 zero pad bytes. A pong is 42 bytes: protocol version,
//! flags, height, tip, and the 4 IPv4 octets of the datagram sender as
//! the server observed them. Trailing bytes on input are ignored.

use std::fmt;
use thiserror::Error;

/// Genesis blocktime (which is actually wrong).
pub const MAGIC: i32 = 1446058291;

/// Status protocol version advertised in pings and pongs.
pub const PROTOCOL_VERSION: u8 = 1;

pub const PING_SIZE: usize = 69;
pub const PONG_SIZE: usize = 42;

/// Length of the cacheable pong prefix: everything except the per-sender
/// source address.
pub const PONG_PREFIX_SIZE: usize = PONG_SIZE - 4;

/// Bit 0 of the pong flags: the server is accepting wallet clients.
pub const FLAG_AVAILABLE: u8 = 0b0000_0001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid magic bytes")]
    BadMagic,
    #[error("short packet: {0} bytes")]
    BadLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpvPing {
    pub protocol_version: u8,
}

impl SpvPing {
    pub fn encode(&self) -> [u8; PING_SIZE] {
        let mut buf = [0u8; PING_SIZE];
        buf[..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = self.protocol_version;
        buf
    }

    pub fn make() -> [u8; PING_SIZE] {
        Self { protocol_version: PROTOCOL_VERSION }.encode()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < PING_SIZE {
            return Err(DecodeError::BadLength(packet.len()));
        }
        let magic = i32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if magic != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        Ok(Self { protocol_version: packet[4] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpvPong {
    pub protocol_version: u8,
    pub flags: u8,
    pub height: i32,
    pub tip: [u8; 32],
    pub source_ip: [u8; 4],
}

impl SpvPong {
    /// The cacheable 38-byte prefix: a full pong minus the source address,
    /// which the server appends per response.
    pub fn make(height: i32, tip: &[u8; 32], flags: u8, protocol_version: u8) -> [u8; PONG_PREFIX_SIZE] {
        let mut buf = [0u8; PONG_PREFIX_SIZE];
        buf[0] = protocol_version;
        buf[1] = flags;
        buf[2..6].copy_from_slice(&height.to_be_bytes());
        buf[6..38].copy_from_slice(tip);
        buf
    }

    pub fn encode(&self) -> [u8; PONG_SIZE] {
        let mut buf = [0u8; PONG_SIZE];
        buf[..PONG_PREFIX_SIZE]
            .copy_from_slice(&Self::make(self.height, &self.tip, self.flags, self.protocol_version));
        buf[PONG_PREFIX_SIZE..].copy_from_slice(&self.source_ip);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < PONG_SIZE {
            return Err(DecodeError::BadLength(packet.len()));
        }
        let mut tip = [0u8; 32];
        tip.copy_from_slice(&packet[6..38]);
        let mut source_ip = [0u8; 4];
        source_ip.copy_from_slice(&packet[38..42]);
        Ok(Self {
            protocol_version: packet[0],
            flags: packet[1],
            height: i32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]),
            tip,
            source_ip,
        })
    }

    pub fn available(&self) -> bool {
        self.flags & FLAG_AVAILABLE > 0
    }

    /// Dotted-quad rendering of the source address the server saw.
    pub fn ip_address(&self) -> String {
        let [a, b, c, d] = self.source_ip;
        format!("{a}.{b}.{c}.{d}")
    }
}

impl fmt::Display for SpvPong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tip renders reversed, the way block hashes are displayed.
        let tip: Vec<u8> = self.tip.iter().rev().copied().collect();
        write!(
            f,
            "SpvPong(external_ip={}, version={}, available={}, height={}, tip={})",
            self.ip_address(),
            self.protocol_version,
            self.available(),
            self.height,
            hex::encode(tip)
        )
    }
}
