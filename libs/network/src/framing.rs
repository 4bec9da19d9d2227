//! Packet Framing
//!
//! Little-endian length-prefixed frames in two variants:
//!
//! - **Inner** (trusted, process ⇄ process):
//!   `[len: u32][opcode: u16][to: u64][from: u64][kind: u8][body]`
//! - **Outer** (untrusted, client-facing):
//!   `[len: u16][opcode: u16][body]`
//!
//! The length field excludes itself and covers everything after it. The
//! outer variant's two-byte prefix caps what a garbage client can make us
//! allocate before validation; the inner variant has a hard ceiling of
//! 16×64 KiB. A declared length outside `[min_packet, max_packet]` is a
//! fatal framing error: the stream cannot be resynchronized, so the
//! connection must be dropped with no recovery attempt.
//!
//! The parser is an explicit two-state machine,
//! `AwaitingLength → AwaitingBody → (frame ready) → AwaitingLength`,
//! incremental over arbitrary read-chunk boundaries.

use crate::error::{NetworkError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use types::{ActorId, MessageKind};

/// Frame header variant per link trust level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameFormat {
    Inner,
    Outer,
}

impl FrameFormat {
    /// Width of the length prefix.
    pub fn length_bytes(self) -> usize {
        match self {
            FrameFormat::Inner => 4,
            FrameFormat::Outer => 2,
        }
    }

    /// Largest value the length field may declare.
    pub fn max_packet(self) -> usize {
        match self {
            FrameFormat::Inner => 16 * 64 * 1024,
            FrameFormat::Outer => u16::MAX as usize,
        }
    }

    /// Smallest value the length field may declare: the opcode, plus the
    /// routing prefix on inner links.
    pub fn min_packet(self) -> usize {
        match self {
            FrameFormat::Inner => 2 + Route::WIRE_BYTES,
            FrameFormat::Outer => 2,
        }
    }
}

/// Actor routing prefix carried by every inner frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub to: ActorId,
    pub from: ActorId,
    pub kind: MessageKind,
}

impl Route {
    pub const WIRE_BYTES: usize = 8 + 8 + 1;
}

/// One parsed packet: opcode, optional routing prefix, body bytes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub route: Option<Route>,
    pub opcode: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn outer(opcode: u16, body: Bytes) -> Self {
        Self {
            route: None,
            opcode,
            body,
        }
    }

    pub fn inner(route: Route, opcode: u16, body: Bytes) -> Self {
        Self {
            route: Some(route),
            opcode,
            body,
        }
    }
}

/// Serialize a frame into `out`. Fails if the payload would exceed the
/// format's ceiling or if the route presence does not match the format.
pub fn encode_frame(format: FrameFormat, frame: &Frame, out: &mut BytesMut) -> Result<()> {
    match (format, &frame.route) {
        (FrameFormat::Inner, Some(_)) | (FrameFormat::Outer, None) => {}
        (FrameFormat::Inner, None) => {
            return Err(NetworkError::framing("inner frame without route"));
        }
        (FrameFormat::Outer, Some(_)) => {
            return Err(NetworkError::framing("outer frame cannot carry a route"));
        }
    }

    let declared = 2
        + frame.route.map_or(0, |_| Route::WIRE_BYTES)
        + frame.body.len();
    if declared > format.max_packet() {
        return Err(NetworkError::framing(format!(
            "packet of {declared} bytes exceeds ceiling {}",
            format.max_packet()
        )));
    }

    out.reserve(format.length_bytes() + declared);
    match format {
        FrameFormat::Inner => out.put_u32_le(declared as u32),
        FrameFormat::Outer => out.put_u16_le(declared as u16),
    }
    out.put_u16_le(frame.opcode);
    if let Some(route) = frame.route {
        out.put_u64_le(route.to.as_u64());
        out.put_u64_le(route.from.as_u64());
        out.put_u8(route.kind as u8);
    }
    out.put_slice(&frame.body);
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    AwaitingLength,
    AwaitingBody { declared: usize },
}

/// Incremental frame parser. Feed it raw read chunks; pull complete frames.
pub struct FrameParser {
    format: FrameFormat,
    state: ParseState,
    buf: BytesMut,
}

impl FrameParser {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            state: ParseState::AwaitingLength,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next complete frame, if one is buffered. A framing error is
    /// terminal: the parser must not be used again for this connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                ParseState::AwaitingLength => {
                    if self.buf.len() < self.format.length_bytes() {
                        return Ok(None);
                    }
                    let declared = match self.format {
                        FrameFormat::Inner => self.buf.get_u32_le() as usize,
                        FrameFormat::Outer => self.buf.get_u16_le() as usize,
                    };
                    if declared < self.format.min_packet() {
                        return Err(NetworkError::framing(format!(
                            "declared length {declared} below minimum {}",
                            self.format.min_packet()
                        )));
                    }
                    if declared > self.format.max_packet() {
                        return Err(NetworkError::framing(format!(
                            "declared length {declared} above ceiling {}",
                            self.format.max_packet()
                        )));
                    }
                    self.state = ParseState::AwaitingBody { declared };
                }
                ParseState::AwaitingBody { declared } => {
                    if self.buf.len() < declared {
                        return Ok(None);
                    }
                    let mut packet = self.buf.split_to(declared);
                    self.state = ParseState::AwaitingLength;

                    let opcode = packet.get_u16_le();
                    if opcode == 0 {
                        return Err(NetworkError::framing("opcode 0 is invalid"));
                    }
                    let route = match self.format {
                        FrameFormat::Inner => {
                            let to = ActorId::from_u64(packet.get_u64_le());
                            let from = ActorId::from_u64(packet.get_u64_le());
                            let raw_kind = packet.get_u8();
                            let kind = MessageKind::from_u8(raw_kind).ok_or_else(|| {
                                NetworkError::framing(format!(
                                    "unknown message kind {raw_kind}"
                                ))
                            })?;
                            Some(Route { to, from, kind })
                        }
                        FrameFormat::Outer => None,
                    };
                    return Ok(Some(Frame {
                        route,
                        opcode,
                        body: packet.freeze(),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            to: ActorId::new(1, 2, 3),
            from: ActorId::new(4, 5, 6),
            kind: MessageKind::Request,
        }
    }

    #[test]
    fn outer_round_trip() {
        let mut wire = BytesMut::new();
        let frame = Frame::outer(42, Bytes::from_static(b"hello"));
        encode_frame(FrameFormat::Outer, &frame, &mut wire).unwrap();

        let mut parser = FrameParser::new(FrameFormat::Outer);
        parser.feed(&wire);
        let parsed = parser.next_frame().unwrap().unwrap();
        assert_eq!(parsed.opcode, 42);
        assert_eq!(&parsed.body[..], b"hello");
        assert!(parsed.route.is_none());
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn inner_round_trip_carries_route() {
        let mut wire = BytesMut::new();
        let frame = Frame::inner(route(), 7, Bytes::from_static(b"payload"));
        encode_frame(FrameFormat::Inner, &frame, &mut wire).unwrap();

        let mut parser = FrameParser::new(FrameFormat::Inner);
        parser.feed(&wire);
        let parsed = parser.next_frame().unwrap().unwrap();
        assert_eq!(parsed.opcode, 7);
        assert_eq!(parsed.route, Some(route()));
        assert_eq!(&parsed.body[..], b"payload");
    }

    #[test]
    fn split_feeds_reassemble() {
        let mut wire = BytesMut::new();
        for i in 0..3u8 {
            let frame = Frame::outer(10 + i as u16, Bytes::copy_from_slice(&[i; 5]));
            encode_frame(FrameFormat::Outer, &frame, &mut wire).unwrap();
        }

        let mut parser = FrameParser::new(FrameFormat::Outer);
        let mut got = Vec::new();
        // One byte at a time: the state machine must survive any chunking.
        for b in wire.iter() {
            parser.feed(&[*b]);
            while let Some(frame) = parser.next_frame().unwrap() {
                got.push(frame);
            }
        }
        assert_eq!(got.len(), 3);
        for (i, frame) in got.iter().enumerate() {
            assert_eq!(frame.opcode, 10 + i as u16);
            assert_eq!(&frame.body[..], &[i as u8; 5]);
        }
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut parser = FrameParser::new(FrameFormat::Inner);
        let declared = (FrameFormat::Inner.max_packet() + 1) as u32;
        parser.feed(&declared.to_le_bytes());
        assert!(matches!(
            parser.next_frame(),
            Err(NetworkError::Framing { .. })
        ));
    }

    #[test]
    fn undersize_length_is_fatal() {
        let mut parser = FrameParser::new(FrameFormat::Outer);
        parser.feed(&1u16.to_le_bytes());
        assert!(matches!(
            parser.next_frame(),
            Err(NetworkError::Framing { .. })
        ));
    }

    #[test]
    fn zero_opcode_is_fatal() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&2u16.to_le_bytes());
        wire.extend_from_slice(&0u16.to_le_bytes());
        let mut parser = FrameParser::new(FrameFormat::Outer);
        parser.feed(&wire);
        assert!(matches!(
            parser.next_frame(),
            Err(NetworkError::Framing { .. })
        ));
    }

    #[test]
    fn oversize_encode_rejected() {
        let body = Bytes::from(vec![0u8; FrameFormat::Outer.max_packet()]);
        let frame = Frame::outer(1, body);
        let mut out = BytesMut::new();
        assert!(matches!(
            encode_frame(FrameFormat::Outer, &frame, &mut out),
            Err(NetworkError::Framing { .. })
        ));
    }
}
