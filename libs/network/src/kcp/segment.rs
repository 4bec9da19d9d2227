//! ARQ Segment Wire Format
//!
//! Each `MSG` datagram carries a run of segments, every one self-describing:
//!
//! `[conv: u32][cmd: u8][frg: u8][wnd: u16][ts: u32][sn: u32][una: u32][len: u32][data]`
//!
//! All fields little-endian. `conv` is the conversation id as the receiver
//! knows it, so a listener can demultiplex datagrams from one socket. `frg`
//! counts the fragments remaining after this one (0 = final fragment of a
//! message). `wnd` advertises the sender's free receive window. `una` is
//! cumulative: every sequence number below it is acknowledged regardless of
//! the segment's own command.

use crate::error::{NetworkError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::Cursor;

/// Segment commands within a `MSG` datagram.
pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;

pub const SEGMENT_HEADER_BYTES: usize = 4 + 1 + 1 + 2 + 4 + 4 + 4 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: Bytes,
}

impl Segment {
    pub fn ack(conv: u32, wnd: u16, ts: u32, sn: u32, una: u32) -> Self {
        Self {
            conv,
            cmd: CMD_ACK,
            frg: 0,
            wnd,
            ts,
            sn,
            una,
            data: Bytes::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        SEGMENT_HEADER_BYTES + self.data.len()
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd);
        out.push(self.frg);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Parse every segment in a `MSG` datagram body. Truncated input is a
    /// framing error: datagrams are not re-split by the network, so a short
    /// segment means a corrupt or hostile peer.
    pub fn parse_all(body: &[u8]) -> Result<Vec<Segment>> {
        let mut cursor = Cursor::new(body);
        let mut segments = Vec::new();
        while (cursor.position() as usize) < body.len() {
            let remaining = body.len() - cursor.position() as usize;
            if remaining < SEGMENT_HEADER_BYTES {
                return Err(NetworkError::framing("truncated arq segment header"));
            }
            let conv = cursor.read_u32::<LittleEndian>()?;
            let cmd = cursor.read_u8()?;
            let frg = cursor.read_u8()?;
            let wnd = cursor.read_u16::<LittleEndian>()?;
            let ts = cursor.read_u32::<LittleEndian>()?;
            let sn = cursor.read_u32::<LittleEndian>()?;
            let una = cursor.read_u32::<LittleEndian>()?;
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let start = cursor.position() as usize;
            if body.len() - start < len {
                return Err(NetworkError::framing("truncated arq segment data"));
            }
            cursor.set_position((start + len) as u64);
            if cmd != CMD_PUSH && cmd != CMD_ACK {
                return Err(NetworkError::framing(format!("unknown arq command {cmd}")));
            }
            segments.push(Segment {
                conv,
                cmd,
                frg,
                wnd,
                ts,
                sn,
                una,
                data: Bytes::copy_from_slice(&body[start..start + len]),
            });
        }
        Ok(segments)
    }
}
