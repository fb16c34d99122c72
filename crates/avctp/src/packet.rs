//! AVCTP packet framing
//!
//! This module provides the AVCTP header format, fragmentation of outbound
//! messages that exceed the peer MTU, and reassembly of inbound fragments.
//!
//! Every header starts with one byte laid out as
//! `label(4) | packet type(2) | C/R(1) | IPID(1)`. Single packets follow it
//! with a big-endian profile id, start packets with a fragment count and the
//! profile id. Continue and end packets carry the first byte only.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::io::Cursor;

use crate::constants::*;
use crate::error::{AvctError, AvctResult};
use crate::types::CommandResponse;

/// AVCTP packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Single = 0,
    Start = 1,
    Continue = 2,
    End = 3,
}

impl PacketType {
    pub fn from_header(byte: u8) -> Self {
        match (byte & PACKET_TYPE_MASK) >> PACKET_TYPE_SHIFT {
            0 => PacketType::Single,
            1 => PacketType::Start,
            2 => PacketType::Continue,
            _ => PacketType::End,
        }
    }
}

/// Build the first header byte
pub fn header_byte(label: u8, packet_type: PacketType, cr: CommandResponse) -> u8 {
    ((label & MAX_LABEL) << LABEL_SHIFT) | ((packet_type as u8) << PACKET_TYPE_SHIFT) | cr.bits()
}

/// Header of a single (or reassembled) packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Transaction label
    pub label: u8,
    pub packet_type: PacketType,
    pub cr: CommandResponse,
    /// Invalid profile id bit
    pub ipid: bool,
    /// Profile id
    pub pid: u16,
}

impl MessageHeader {
    pub fn new(label: u8, cr: CommandResponse, pid: u16) -> Self {
        Self {
            label: label & MAX_LABEL,
            packet_type: PacketType::Single,
            cr,
            ipid: cr == CommandResponse::Reject,
            pid,
        }
    }

    /// Header of the reject sent back for a command addressed to an unknown profile
    pub fn reject(label: u8, pid: u16) -> Self {
        Self::new(label, CommandResponse::Reject, pid)
    }

    /// Parse the 3-byte single packet header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SINGLE_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let first = cursor.read_u8().ok()?;
        let pid = cursor.read_u16::<BigEndian>().ok()?;

        Some(Self {
            label: first >> LABEL_SHIFT,
            packet_type: PacketType::from_header(first),
            cr: CommandResponse::from_header(first),
            ipid: first & IPID_MASK != 0,
            pid,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SINGLE_HEADER_SIZE);
        let mut first = header_byte(self.label, self.packet_type, self.cr);
        if self.ipid {
            first |= IPID_MASK;
        }
        bytes.push(first);
        // Writes into a Vec cannot fail
        let _ = bytes.write_u16::<BigEndian>(self.pid);
        bytes
    }
}

/// Encode a message that fits into a single packet
pub fn encode_single(label: u8, cr: CommandResponse, pid: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = MessageHeader::new(label, cr, pid).to_bytes();
    packet.extend_from_slice(payload);
    packet
}

/// Split a message into packets no larger than `mtu`
///
/// Returns a single packet when the payload plus its 3-byte header fits,
/// otherwise a start packet, zero or more continue packets and an end packet.
pub fn fragment(
    payload: &[u8],
    mtu: u16,
    label: u8,
    cr: CommandResponse,
    pid: u16,
) -> AvctResult<Vec<Vec<u8>>> {
    let mtu_size = mtu as usize;
    if payload.len() + SINGLE_HEADER_SIZE <= mtu_size {
        return Ok(vec![encode_single(label, cr, pid, payload)]);
    }

    if mtu < MIN_FRAGMENT_MTU {
        return Err(AvctError::MessageTooLarge {
            size: payload.len(),
            mtu,
        });
    }

    let first_size = mtu_size - START_HEADER_SIZE;
    let next_size = mtu_size - CONTINUE_HEADER_SIZE;
    let count = (payload.len() - first_size).div_ceil(next_size) + 1;
    if count > MAX_FRAGMENTS {
        return Err(AvctError::MessageTooLarge {
            size: payload.len(),
            mtu,
        });
    }

    debug!(
        "Fragmenting {} byte message into {} packets (mtu {})",
        payload.len(),
        count,
        mtu
    );

    let mut packets = Vec::with_capacity(count);

    let mut start = Vec::with_capacity(mtu_size);
    start.push(header_byte(label, PacketType::Start, cr));
    start.push(count as u8);
    let _ = start.write_u16::<BigEndian>(pid);
    start.extend_from_slice(&payload[..first_size]);
    packets.push(start);

    let mut remaining = &payload[first_size..];
    while remaining.len() > next_size {
        let (chunk, rest) = remaining.split_at(next_size);
        let mut packet = Vec::with_capacity(mtu_size);
        packet.push(header_byte(label, PacketType::Continue, cr));
        packet.extend_from_slice(chunk);
        packets.push(packet);
        remaining = rest;
    }

    let mut end = Vec::with_capacity(remaining.len() + END_HEADER_SIZE);
    end.push(header_byte(label, PacketType::End, cr));
    end.extend_from_slice(remaining);
    packets.push(end);

    Ok(packets)
}

/// Per-channel reassembly of fragmented inbound messages
///
/// Completed messages are returned in single packet form so that header
/// parsing downstream has only one shape to handle.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Option<Vec<u8>>,
    expected: u8,
    received: u8,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fragmented message is partially received
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn reset(&mut self) {
        self.buffer = None;
        self.expected = 0;
        self.received = 0;
    }

    /// Feed one inbound packet, returning the complete message once available
    pub fn push(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        let first = *packet.first()?;

        match PacketType::from_header(first) {
            PacketType::Single => {
                if packet.len() < SINGLE_HEADER_SIZE {
                    warn!("Dropping truncated single packet ({} bytes)", packet.len());
                    return None;
                }
                Some(packet.to_vec())
            }
            PacketType::Start => {
                if packet.len() < START_HEADER_SIZE {
                    warn!("Dropping truncated start packet ({} bytes)", packet.len());
                    return None;
                }
                if self.buffer.is_some() {
                    debug!("Discarding stale reassembly buffer");
                }

                let mut buffer = Vec::with_capacity(packet.len() - 1);
                buffer.push(first & !PACKET_TYPE_MASK);
                buffer.extend_from_slice(&packet[2..START_HEADER_SIZE]);
                buffer.extend_from_slice(&packet[START_HEADER_SIZE..]);

                self.buffer = Some(buffer);
                self.expected = packet[1];
                self.received = 1;
                None
            }
            PacketType::Continue => {
                let Some(buffer) = self.buffer.as_mut() else {
                    warn!("Dropping continue packet without a start packet");
                    return None;
                };
                // The end packet must still fit in the announced count
                if self.received.saturating_add(1) >= self.expected {
                    warn!(
                        "Dropping message exceeding the {} fragments its start packet announced",
                        self.expected
                    );
                    self.reset();
                    return None;
                }
                buffer.extend_from_slice(&packet[CONTINUE_HEADER_SIZE..]);
                self.received += 1;
                None
            }
            PacketType::End => {
                let Some(mut buffer) = self.buffer.take() else {
                    warn!("Dropping end packet without a start packet");
                    return None;
                };
                buffer.extend_from_slice(&packet[END_HEADER_SIZE..]);
                let received = self.received.saturating_add(1);
                if received != self.expected {
                    warn!(
                        "Reassembled {} fragments, start packet announced {}",
                        received, self.expected
                    );
                }
                self.expected = 0;
                self.received = 0;
                Some(buffer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_header_layout() {
        let header = MessageHeader::new(0x0A, CommandResponse::Response, 0x110E);
        let bytes = header.to_bytes();
        assert_eq!(bytes, vec![0xA2, 0x11, 0x0E]);

        let parsed = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(!parsed.ipid);
    }

    #[test]
    fn test_reject_header_sets_ipid() {
        let bytes = MessageHeader::reject(0x03, 0x1234).to_bytes();
        assert_eq!(bytes, vec![0x33, 0x12, 0x34]);

        let parsed = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.cr, CommandResponse::Reject);
        assert!(parsed.ipid);
        assert_eq!(parsed.label, 0x03);
    }

    #[test]
    fn test_small_message_is_single_packet() {
        let packets = fragment(&[1, 2, 3], 48, 1, CommandResponse::Command, 0x110E).unwrap();
        assert_eq!(packets, vec![vec![0x10, 0x11, 0x0E, 1, 2, 3]]);

        // Exactly fills the MTU
        let payload = vec![0u8; 45];
        let packets = fragment(&payload, 48, 1, CommandResponse::Command, 0x110E).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 48);
    }

    #[test]
    fn test_fragment_mtu_40_payload_100() {
        let payload: Vec<u8> = (0..100u8).collect();
        let packets = fragment(&payload, 40, 5, CommandResponse::Command, 0x110E).unwrap();

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][0], 0x54);
        assert_eq!(packets[0][1], 3);
        assert_eq!(&packets[0][2..4], &[0x11, 0x0E]);
        assert_eq!(packets[0].len() - START_HEADER_SIZE, 36);
        assert_eq!(PacketType::from_header(packets[1][0]), PacketType::Continue);
        assert_eq!(PacketType::from_header(packets[2][0]), PacketType::End);

        let rest: usize = packets[1..].iter().map(|p| p.len() - 1).sum();
        assert_eq!(rest, 64);
        assert!(packets.iter().all(|p| p.len() <= 40));

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&packets[0]).is_none());
        assert!(reassembler.in_progress());
        assert!(reassembler.push(&packets[1]).is_none());
        let message = reassembler.push(&packets[2]).unwrap();
        assert!(!reassembler.in_progress());

        let header = MessageHeader::parse(&message).unwrap();
        assert_eq!(header.packet_type, PacketType::Single);
        assert_eq!(header.label, 5);
        assert_eq!(header.pid, 0x110E);
        assert_eq!(&message[SINGLE_HEADER_SIZE..], payload.as_slice());
    }

    #[test]
    fn test_mtu_too_small() {
        let result = fragment(&[0u8; 8], 4, 0, CommandResponse::Command, 0x110E);
        assert!(matches!(result, Err(AvctError::MessageTooLarge { size: 8, mtu: 4 })));
    }

    #[test]
    fn test_too_many_fragments() {
        let payload = vec![0u8; 2000];
        let result = fragment(&payload, 5, 0, CommandResponse::Command, 0x110E);
        assert!(matches!(result, Err(AvctError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_continue_without_start_is_dropped() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&[0x08, 1, 2, 3]).is_none());
        assert!(reassembler.push(&[0x0C, 4, 5]).is_none());
        assert!(!reassembler.in_progress());
        assert!(reassembler.push(&[]).is_none());
    }

    #[test]
    fn test_start_discards_stale_buffer() {
        let payload: Vec<u8> = (0..30u8).collect();
        let packets = fragment(&payload, 12, 2, CommandResponse::Response, 0x0110).unwrap();

        let mut reassembler = Reassembler::new();
        // A stale start followed by a full new message
        reassembler.push(&[0x24, 9, 0x01, 0x10, 0xEE, 0xEE]);
        let mut complete = None;
        for packet in &packets {
            complete = reassembler.push(packet);
        }

        let message = complete.unwrap();
        assert_eq!(&message[..SINGLE_HEADER_SIZE], &[0x22, 0x01, 0x10]);
        assert_eq!(&message[SINGLE_HEADER_SIZE..], payload.as_slice());
    }

    #[test]
    fn test_continue_beyond_announced_count_is_dropped() {
        let mut reassembler = Reassembler::new();
        // Start announcing two fragments, then an extra continue
        assert!(reassembler.push(&[0x14, 2, 0x11, 0x0E, 0xAA]).is_none());
        assert!(reassembler.push(&[0x18, 0xBB]).is_none());
        assert!(!reassembler.in_progress());
        assert!(reassembler.push(&[0x1C, 0xCC]).is_none());

        // A stream of continue packets never grows the buffer
        assert!(reassembler.push(&[0x14, 3, 0x11, 0x0E, 0xAA]).is_none());
        assert!(reassembler.push(&[0x18, 0xBB]).is_none());
        assert!(reassembler.in_progress());
        for _ in 0..100 {
            assert!(reassembler.push(&[0x18; 64]).is_none());
        }
        assert!(!reassembler.in_progress());

        // The next well formed message still goes through
        assert!(reassembler.push(&[0x14, 2, 0x11, 0x0E, 0xAA]).is_none());
        assert_eq!(
            reassembler.push(&[0x1C, 0xCC]),
            Some(vec![0x10, 0x11, 0x0E, 0xAA, 0xCC])
        );
    }

    #[test]
    fn test_truncated_single_packet() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&[0x10, 0x11]).is_none());
        assert_eq!(reassembler.push(&[0x10, 0x11, 0x0E]), Some(vec![0x10, 0x11, 0x0E]));
    }
}
