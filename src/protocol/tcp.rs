//! TCP protocol - RFC 793
//!
//! Header parsing, port rewriting and checksum recomputation for translation.

use super::checksum;
use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP protocol number
pub const PROTOCOL_NUMBER: u8 = 6;

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    /// Parse flags from the 14th byte of the TCP header
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: (byte & 0x01) != 0,
            syn: (byte & 0x02) != 0,
            rst: (byte & 0x04) != 0,
            psh: (byte & 0x08) != 0,
            ack: (byte & 0x10) != 0,
            urg: (byte & 0x20) != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.fin {
            byte |= 0x01;
        }
        if self.syn {
            byte |= 0x02;
        }
        if self.rst {
            byte |= 0x04;
        }
        if self.psh {
            byte |= 0x08;
        }
        if self.ack {
            byte |= 0x10;
        }
        if self.urg {
            byte |= 0x20;
        }
        byte
    }
}

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Header length in bytes, from the data offset field
    pub fn header_len(&self) -> usize {
        ((self.buffer[12] >> 4) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_byte(self.buffer[13])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[16], self.buffer[17]])
    }
}

/// Rewrites the source port of the TCP segment starting at "segment".
pub fn set_src_port(segment: &mut [u8], port: u16) {
    segment[0..2].copy_from_slice(&port.to_be_bytes());
}

/// Rewrites the destination port of the TCP segment starting at "segment".
pub fn set_dst_port(segment: &mut [u8], port: u16) {
    segment[2..4].copy_from_slice(&port.to_be_bytes());
}

/// Recomputes the checksum of "segment" across an IPv4 pseudo-header.
pub fn write_checksum_v4(segment: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr) {
    segment[16..18].copy_from_slice(&[0, 0]);
    let ck = checksum::l4_checksum_v4(src, dst, PROTOCOL_NUMBER, segment);
    segment[16..18].copy_from_slice(&ck.to_be_bytes());
}

/// Recomputes the checksum of "segment" across an IPv6 pseudo-header.
pub fn write_checksum_v6(segment: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
    segment[16..18].copy_from_slice(&[0, 0]);
    let ck = checksum::l4_checksum_v6(src, dst, PROTOCOL_NUMBER, segment);
    segment[16..18].copy_from_slice(&ck.to_be_bytes());
}

/// Builds a bare 20-byte TCP header with zeroed checksum.
pub fn build_header(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack_seq: u32,
    flags: TcpFlags,
    window: u16,
) -> [u8; MIN_HEADER_SIZE] {
    let mut hdr = [0u8; MIN_HEADER_SIZE];
    hdr[0..2].copy_from_slice(&src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_be_bytes());
    hdr[4..8].copy_from_slice(&seq.to_be_bytes());
    hdr[8..12].copy_from_slice(&ack_seq.to_be_bytes());
    hdr[12] = 0x50; // data offset 5
    hdr[13] = flags.to_byte();
    hdr[14..16].copy_from_slice(&window.to_be_bytes());
    hdr
}
