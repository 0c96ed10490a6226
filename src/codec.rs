//! Wire codec for messages between the management node and its peers.
//! Frame: [Len:4][Magic:4][Version:1][Kind:1][Time:8][Node:4][Mask:8][CRC32:4][Body]
//!
//! All integers are little-endian. `Len` counts every byte after the
//! length prefix. The CRC covers the body only; header fields are
//! validated structurally.

use thiserror::Error;

use crate::types::{NodeId, SimTime, UpdateMask};

/// Magic bytes identifying a coordinator frame.
pub const WIRE_MAGIC: [u8; 4] = [0x4F, 0x42, 0x4E, 0x31]; // "OBN1"

/// Current protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Maximum frame size (64 KiB); anything larger is rejected outright.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Fixed bytes following the length prefix, before the body.
const HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 4 + 8 + 4;

/// Message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Start of simulation: carries the time-unit scale and the block
    /// catalog size the node must confirm.
    Init = 0,
    /// Output-computation request for the masked blocks.
    UpdateY = 1,
    /// State-update request for the masked blocks.
    UpdateX = 2,
    /// Node acknowledgement of Init/UpdateY/UpdateX/Term.
    Ack = 3,
    /// Node-initiated request for a future irregular firing.
    Event = 4,
    /// Simulation termination.
    Term = 5,
    /// Node-reported fatal error.
    Error = 6,
    /// Startup: node announces a port.
    SysOpenPort = 7,
    /// Startup: node requests to join the federation.
    SysRequestConnect = 8,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Init),
            1 => Some(Self::UpdateY),
            2 => Some(Self::UpdateX),
            3 => Some(Self::Ack),
            4 => Some(Self::Event),
            5 => Some(Self::Term),
            6 => Some(Self::Error),
            7 => Some(Self::SysOpenPort),
            8 => Some(Self::SysRequestConnect),
            _ => None,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("bad frame fields: {0}")]
    BadFields(String),
}

/// Ack status carried in `SIM_ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The node completed the acknowledged phase.
    Ok,
    /// The node failed the phase; the code is node-defined.
    Failed(u8),
}

impl AckStatus {
    fn to_u8(self) -> u8 {
        match self {
            AckStatus::Ok => 0,
            AckStatus::Failed(code) => code.max(1),
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 0 {
            AckStatus::Ok
        } else {
            AckStatus::Failed(v)
        }
    }
}

/// A future irregular firing requested by a node, either as a standalone
/// `SIM_EVENT` frame or piggybacked on an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRequest {
    /// Requested virtual fire time.
    pub fire_time: SimTime,
    /// Blocks to fire, as a local mask.
    pub mask: UpdateMask,
}

/// Kind-specific message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Init {
        /// Wall-clock microseconds per time atom.
        time_unit_us: u64,
        /// Number of blocks the node is expected to have declared.
        block_count: u32,
    },
    UpdateY,
    UpdateX,
    Ack {
        /// Which request kind this ack answers.
        of: MessageKind,
        status: AckStatus,
        /// Optional piggybacked irregular-event request.
        next_event: Option<EventRequest>,
    },
    Event {
        /// Requested virtual fire time; the frame mask names the blocks.
        fire_time: SimTime,
    },
    Term,
    Error {
        code: u32,
        info: String,
    },
    SysOpenPort {
        port: String,
    },
    SysRequestConnect {
        workspace: String,
        name: String,
        /// Size of the block catalog the node declares; checked against the
        /// configured signature at registration.
        block_count: u32,
    },
}

impl Body {
    /// The wire kind this body encodes as.
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Init { .. } => MessageKind::Init,
            Body::UpdateY => MessageKind::UpdateY,
            Body::UpdateX => MessageKind::UpdateX,
            Body::Ack { .. } => MessageKind::Ack,
            Body::Event { .. } => MessageKind::Event,
            Body::Term => MessageKind::Term,
            Body::Error { .. } => MessageKind::Error,
            Body::SysOpenPort { .. } => MessageKind::SysOpenPort,
            Body::SysRequestConnect { .. } => MessageKind::SysRequestConnect,
        }
    }
}

/// A decoded protocol message.
///
/// `time` is the sender's virtual time stamp, `node` identifies the peer
/// (for coordinator-sent frames, the addressee), `mask` is the update mask
/// the operation applies to (zero where not meaningful).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub time: SimTime,
    pub node: NodeId,
    pub mask: UpdateMask,
    pub body: Body,
}

impl Message {
    pub fn new(time: SimTime, node: NodeId, mask: UpdateMask, body: Body) -> Self {
        Self { time, node, mask, body }
    }

    /// Shorthand for an ack frame answering `of` with status Ok.
    pub fn ack(time: SimTime, node: NodeId, mask: UpdateMask, of: MessageKind) -> Self {
        Self::new(
            time,
            node,
            mask,
            Body::Ack { of, status: AckStatus::Ok, next_event: None },
        )
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn encode_body(body: &Body) -> Vec<u8> {
    let mut buf = Vec::new();
    match body {
        Body::Init { time_unit_us, block_count } => {
            buf.extend_from_slice(&time_unit_us.to_le_bytes());
            buf.extend_from_slice(&block_count.to_le_bytes());
        }
        Body::UpdateY | Body::UpdateX | Body::Term => {}
        Body::Ack { of, status, next_event } => {
            buf.push(*of as u8);
            buf.push(status.to_u8());
            match next_event {
                Some(req) => {
                    buf.push(1);
                    buf.extend_from_slice(&(req.fire_time as i64).to_le_bytes());
                    buf.extend_from_slice(&req.mask.to_le_bytes());
                }
                None => buf.push(0),
            }
        }
        Body::Event { fire_time } => {
            buf.extend_from_slice(&(*fire_time as i64).to_le_bytes());
        }
        Body::Error { code, info } => {
            buf.extend_from_slice(&code.to_le_bytes());
            buf.extend_from_slice(info.as_bytes());
        }
        Body::SysOpenPort { port } => {
            put_string(&mut buf, port);
        }
        Body::SysRequestConnect { workspace, name, block_count } => {
            put_string(&mut buf, workspace);
            put_string(&mut buf, name);
            buf.extend_from_slice(&block_count.to_le_bytes());
        }
    }
    buf
}

/// Encodes a message into a complete frame, length prefix included.
pub fn encode(msg: &Message) -> Vec<u8> {
    let body = encode_body(&msg.body);
    let crc = crc32fast::hash(&body);

    let len = (HEADER_SIZE + body.len()) as u32;
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&WIRE_MAGIC);
    buf.push(WIRE_VERSION);
    buf.push(msg.body.kind() as u8);
    buf.extend_from_slice(&(msg.time as i64).to_le_bytes());
    buf.extend_from_slice(&msg.node.to_le_bytes());
    buf.extend_from_slice(&msg.mask.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Cursor over a body slice with bounds-checked reads.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn time(&mut self) -> Result<SimTime, CodecError> {
        let raw = self.i64()?;
        if raw < 0 {
            return Err(CodecError::BadFields(format!("negative time {raw}")));
        }
        Ok(raw as SimTime)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::BadFields("invalid utf-8 string".into()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::BadFields(format!(
                "{} trailing bytes in body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Body, CodecError> {
    let mut r = Reader::new(body);
    let decoded = match kind {
        MessageKind::Init => Body::Init {
            time_unit_us: r.u64()?,
            block_count: r.u32()?,
        },
        MessageKind::UpdateY => Body::UpdateY,
        MessageKind::UpdateX => Body::UpdateX,
        MessageKind::Ack => {
            let of_raw = r.u8()?;
            let of = MessageKind::from_u8(of_raw)
                .filter(|k| {
                    matches!(
                        k,
                        MessageKind::Init
                            | MessageKind::UpdateY
                            | MessageKind::UpdateX
                            | MessageKind::Term
                    )
                })
                .ok_or_else(|| CodecError::BadFields(format!("ack of kind {of_raw}")))?;
            let status = AckStatus::from_u8(r.u8()?);
            let next_event = match r.u8()? {
                0 => None,
                1 => Some(EventRequest {
                    fire_time: r.time()?,
                    mask: r.u64()?,
                }),
                other => {
                    return Err(CodecError::BadFields(format!("ack event flag {other}")));
                }
            };
            Body::Ack { of, status, next_event }
        }
        MessageKind::Event => Body::Event { fire_time: r.time()? },
        MessageKind::Term => Body::Term,
        MessageKind::Error => {
            let code = r.u32()?;
            let info = String::from_utf8(r.rest().to_vec())
                .map_err(|_| CodecError::BadFields("invalid utf-8 error info".into()))?;
            Body::Error { code, info }
        }
        MessageKind::SysOpenPort => Body::SysOpenPort { port: r.string()? },
        MessageKind::SysRequestConnect => Body::SysRequestConnect {
            workspace: r.string()?,
            name: r.string()?,
            block_count: r.u32()?,
        },
    };
    r.finish()?;
    Ok(decoded)
}

/// Decodes one complete frame (length prefix included).
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::Truncated { need: 4, have: frame.len() });
    }
    let len = u32::from_le_bytes(frame[..4].try_into().unwrap());
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::BadFields(format!("frame length {len} too large")));
    }
    let total = 4 + len as usize;
    if frame.len() < total {
        return Err(CodecError::Truncated { need: total, have: frame.len() });
    }
    if frame.len() > total {
        return Err(CodecError::BadFields(format!(
            "{} bytes past frame end",
            frame.len() - total
        )));
    }
    if (len as usize) < HEADER_SIZE {
        return Err(CodecError::Truncated { need: 4 + HEADER_SIZE, have: frame.len() });
    }

    let mut r = Reader::new(&frame[4..total]);
    let magic = r.take(4).expect("header length checked");
    if magic != WIRE_MAGIC {
        return Err(CodecError::BadFields("bad magic".into()));
    }
    let version = r.u8().expect("header length checked");
    if version != WIRE_VERSION {
        return Err(CodecError::BadFields(format!("unsupported version {version}")));
    }
    let kind_raw = r.u8().expect("header length checked");
    let kind = MessageKind::from_u8(kind_raw).ok_or(CodecError::UnknownKind(kind_raw))?;
    let time = r.time()?;
    let node = r.u32().expect("header length checked");
    let mask = r.u64().expect("header length checked");
    let crc = r.u32().expect("header length checked");

    let body_bytes = r.rest();
    if crc32fast::hash(body_bytes) != crc {
        return Err(CodecError::BadFields("body crc mismatch".into()));
    }

    let body = decode_body(kind, body_bytes)?;
    Ok(Message { time, node, mask, body })
}
