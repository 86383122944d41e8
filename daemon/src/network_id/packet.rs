//! Wire messages for the network-id manager.
//!
//! Message types:
//! - STORE_SECRET (0x01): Lodge a secret at a direct neighbour, never forwarded
//! - ACCEPTED (0x02): Ack for STORE_SECRET
//! - SECRET_PING (0x03): Forwardable probe towards a target location
//! - SECRET_PONG (0x04): Probe success, carries the secret back
//! - REJECTED_LOOP (0x05): Loop, short path or no-route
//! - NETWORK_ID (0x06): Peer announces the network id it believes in

use veil_common::serializer::{Reader, ReaderError, Serializer, Writer};

/// Message type identifiers.
pub mod packet_type {
    pub const STORE_SECRET: u8 = 0x01;
    pub const ACCEPTED: u8 = 0x02;
    pub const SECRET_PING: u8 = 0x03;
    pub const SECRET_PONG: u8 = 0x04;
    pub const REJECTED_LOOP: u8 = 0x05;
    pub const NETWORK_ID: u8 = 0x06;
}

/// Lodge a 64-bit secret at a direct neighbour.
///
/// Peer-to-peer only: a node receiving this stores it, it never travels
/// further than one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSecret {
    pub uid: u64,
    pub secret: u64,
}

impl StoreSecret {
    pub fn new(uid: u64, secret: u64) -> Self {
        Self { uid, secret }
    }
}

impl Serializer for StoreSecret {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let uid = reader.read_u64()?;
        let secret = reader.read_u64()?;
        Ok(Self { uid, secret })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.uid);
        writer.write_u64(&self.secret);
    }

    fn size(&self) -> usize {
        8 + 8 // uid + secret
    }
}

/// Ack for a stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub uid: u64,
}

impl Accepted {
    pub fn new(uid: u64) -> Self {
        Self { uid }
    }
}

impl Serializer for Accepted {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            uid: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.uid);
    }

    fn size(&self) -> usize {
        8 // uid
    }
}

/// Forwardable probe asking whether the node holding `uid`'s secret is
/// reachable near `target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SecretPing {
    pub uid: u64,
    /// Routing target on the location circle.
    pub target: f64,
    /// Remaining hop budget.
    pub htl: i16,
    /// HTL value at which deterministic routing takes over.
    pub dawn_htl: i16,
    /// Hops taken so far, incremented at every node.
    pub counter: i32,
}

impl SecretPing {
    pub fn new(uid: u64, target: f64, htl: i16, dawn_htl: i16, counter: i32) -> Self {
        Self {
            uid,
            target,
            htl,
            dawn_htl,
            counter,
        }
    }
}

impl Serializer for SecretPing {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let uid = reader.read_u64()?;
        let target = reader.read_f64()?;
        // a location outside the circle is a malformed packet
        if !(0.0..=1.0).contains(&target) {
            return Err(ReaderError::InvalidValue);
        }
        let htl = reader.read_i16()?;
        let dawn_htl = reader.read_i16()?;
        let counter = reader.read_i32()?;
        Ok(Self {
            uid,
            target,
            htl,
            dawn_htl,
            counter,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.uid);
        writer.write_f64(&self.target);
        writer.write_i16(self.htl);
        writer.write_i16(self.dawn_htl);
        writer.write_i32(&self.counter);
    }

    fn size(&self) -> usize {
        8 + 8 + 2 + 2 + 4 // uid + target + htl + dawn_htl + counter
    }
}

/// Probe success: the secret lodged under `uid` travelled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPong {
    pub uid: u64,
    pub counter: i32,
    pub secret: u64,
}

impl SecretPong {
    pub fn new(uid: u64, counter: i32, secret: u64) -> Self {
        Self {
            uid,
            counter,
            secret,
        }
    }
}

impl Serializer for SecretPong {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let uid = reader.read_u64()?;
        let counter = reader.read_i32()?;
        let secret = reader.read_u64()?;
        Ok(Self {
            uid,
            counter,
            secret,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.uid);
        writer.write_i32(&self.counter);
        writer.write_u64(&self.secret);
    }

    fn size(&self) -> usize {
        8 + 4 + 8 // uid + counter + secret
    }
}

/// The probe hit a loop, a short path or ran out of routes.
/// A normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedLoop {
    pub uid: u64,
}

impl RejectedLoop {
    pub fn new(uid: u64) -> Self {
        Self { uid }
    }
}

impl Serializer for RejectedLoop {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            uid: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.uid);
    }

    fn size(&self) -> usize {
        8 // uid
    }
}

/// A peer announces the network id it currently believes it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkId {
    pub id: i32,
}

impl NetworkId {
    pub fn new(id: i32) -> Self {
        Self { id }
    }
}

impl Serializer for NetworkId {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            id: reader.read_i32()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_i32(&self.id);
    }

    fn size(&self) -> usize {
        4 // id
    }
}

/// All packets the network-id manager sends or receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    StoreSecret(StoreSecret),
    Accepted(Accepted),
    SecretPing(SecretPing),
    SecretPong(SecretPong),
    RejectedLoop(RejectedLoop),
    NetworkId(NetworkId),
}

impl Serializer for Packet {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let packet = match reader.read_u8()? {
            packet_type::STORE_SECRET => Packet::StoreSecret(StoreSecret::read(reader)?),
            packet_type::ACCEPTED => Packet::Accepted(Accepted::read(reader)?),
            packet_type::SECRET_PING => Packet::SecretPing(SecretPing::read(reader)?),
            packet_type::SECRET_PONG => Packet::SecretPong(SecretPong::read(reader)?),
            packet_type::REJECTED_LOOP => Packet::RejectedLoop(RejectedLoop::read(reader)?),
            packet_type::NETWORK_ID => Packet::NetworkId(NetworkId::read(reader)?),
            _ => return Err(ReaderError::InvalidValue),
        };
        Ok(packet)
    }

    fn write(&self, writer: &mut Writer) {
        match self {
            Packet::StoreSecret(msg) => {
                writer.write_u8(packet_type::STORE_SECRET);
                msg.write(writer);
            }
            Packet::Accepted(msg) => {
                writer.write_u8(packet_type::ACCEPTED);
                msg.write(writer);
            }
            Packet::SecretPing(msg) => {
                writer.write_u8(packet_type::SECRET_PING);
                msg.write(writer);
            }
            Packet::SecretPong(msg) => {
                writer.write_u8(packet_type::SECRET_PONG);
                msg.write(writer);
            }
            Packet::RejectedLoop(msg) => {
                writer.write_u8(packet_type::REJECTED_LOOP);
                msg.write(writer);
            }
            Packet::NetworkId(msg) => {
                writer.write_u8(packet_type::NETWORK_ID);
                msg.write(writer);
            }
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            Packet::StoreSecret(msg) => msg.size(),
            Packet::Accepted(msg) => msg.size(),
            Packet::SecretPing(msg) => msg.size(),
            Packet::SecretPong(msg) => msg.size(),
            Packet::RejectedLoop(msg) => msg.size(),
            Packet::NetworkId(msg) => msg.size(),
        }
    }
}
