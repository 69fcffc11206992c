//! Outer framing of a packet:
//!
//! ```ascii
//!  0: scrambled far id (u32) - XOR of the real id with the next two 32-bit words
//!  4: checksum (u16) over everything from offset 6          \
//!  6: marker (u8)                                            |
//!  7: time (u16)                                             | AES-128-CBC encrypted,
//!  9: echo time (u16) - only if the marker says so           | padded with 0xFF to a
//!  *: sub-messages                                           / multiple of 16 bytes
//! ```

use std::time::Duration;
use bytes::{BufMut, BytesMut};
use crate::crypto::{RtmfpEngine, BLOCK_SIZE};
use crate::error::RtmfpError;

pub const ID_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 2;
/// id, checksum, marker, time and echo time
pub const HEADER_SIZE: usize = 11;
pub const MIN_PACKET_SIZE: usize = 12;
pub const MAX_PACKET_SIZE: usize = 1192;

/// milliseconds per unit of protocol time
pub const TIMESTAMP_SCALE: u64 = 4;

const PADDING_BYTE: u8 = 0xff;

/// 16-bit ones' complement checksum: 16-bit big endian words are summed up (a trailing odd byte
///  is added as an 8-bit value), carries are folded back in, and the result is complemented.
pub fn checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks.by_ref()
        .map(|word| u16::from_be_bytes([word[0], word[1]]) as u64)
        .sum();
    if let [last] = chunks.remainder() {
        sum += *last as u64;
    }

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    !(sum as u16)
}

/// Decrypts a packet in place (everything after the id) and verifies its checksum. The packet
///  must not be processed further if this fails.
pub fn decode(engine: &RtmfpEngine, packet: &mut [u8]) -> anyhow::Result<()> {
    if packet.len() < MIN_PACKET_SIZE {
        return Err(RtmfpError::crypto(format!("packet of {} bytes is too short", packet.len())));
    }
    if (packet.len() - ID_SIZE) % BLOCK_SIZE != 0 {
        return Err(RtmfpError::crypto(format!("packet of {} bytes is not block aligned", packet.len())));
    }

    engine.process(&mut packet[ID_SIZE..])?;

    let received = u16::from_be_bytes([packet[ID_SIZE], packet[ID_SIZE + 1]]);
    let computed = checksum(&packet[ID_SIZE + CHECKSUM_SIZE..]);
    if received != computed {
        return Err(RtmfpError::crypto(format!("checksum mismatch: received {:04x}, computed {:04x}", received, computed)));
    }
    Ok(())
}

/// Finalizes a packet whose first six bytes (id and checksum) are placeholders: pads it with
///  0xFF, stamps the checksum and encrypts everything after the id in place.
pub fn encode(engine: &RtmfpEngine, packet: &mut BytesMut) -> anyhow::Result<()> {
    if packet.len() < ID_SIZE + CHECKSUM_SIZE {
        return Err(RtmfpError::crypto("packet has no room for id and checksum"));
    }

    let padding = (BLOCK_SIZE - (packet.len() - ID_SIZE) % BLOCK_SIZE) % BLOCK_SIZE;
    packet.put_bytes(PADDING_BYTE, padding);

    let crc = checksum(&packet[ID_SIZE + CHECKSUM_SIZE..]);
    packet[ID_SIZE..ID_SIZE + CHECKSUM_SIZE].copy_from_slice(&crc.to_be_bytes());

    engine.process(&mut packet[ID_SIZE..])
}

fn word_at(packet: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([packet[offset], packet[offset + 1], packet[offset + 2], packet[offset + 3]])
}

/// Recovers the session id from the first three 32-bit words of a packet.
pub fn unpack(packet: &[u8]) -> anyhow::Result<u32> {
    if packet.len() < MIN_PACKET_SIZE {
        return Err(RtmfpError::formatting(format!("packet of {} bytes is too short to carry a session id", packet.len())));
    }
    Ok(word_at(packet, 0) ^ word_at(packet, 4) ^ word_at(packet, 8))
}

/// Writes the scrambled far id into an encoded packet.
pub fn pack(packet: &mut [u8], far_id: u32) -> anyhow::Result<()> {
    if packet.len() < MIN_PACKET_SIZE {
        return Err(RtmfpError::formatting(format!("packet of {} bytes is too short to carry a session id", packet.len())));
    }
    let scrambled = word_at(packet, 4) ^ word_at(packet, 8) ^ far_id;
    packet[..ID_SIZE].copy_from_slice(&scrambled.to_be_bytes());
    Ok(())
}

/// Converts elapsed time into (wrapping) protocol time units
pub fn protocol_time(elapsed: Duration) -> u16 {
    ((elapsed.as_millis() / TIMESTAMP_SCALE as u128) & 0xffff) as u16
}
