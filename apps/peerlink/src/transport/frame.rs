//! Binary framing for datagrams exchanged over an established path.
//!
//! Layout: `[version][tag][body...]`. Strings are a big-endian `u16` length
//! followed by UTF-8 bytes. `Data` carries the rest of the datagram as the
//! fragment payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::chunk::Fragment;
use crate::router::PayloadKind;

pub const FRAME_VERSION: u8 = 0x50;

const TAG_PROBE: u8 = 1;
const TAG_PROBE_ACK: u8 = 2;
const TAG_ANNOUNCE: u8 = 3;
const TAG_OPEN: u8 = 4;
const TAG_OPEN_ACK: u8 = 5;
const TAG_CLOSE: u8 = 6;
const TAG_CLOSE_ACK: u8 = 7;
const TAG_DATA: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unsupported frame version {0:#04x}")]
    Version(u8),
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("frame string is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown payload kind {0}")]
    InvalidKind(u8),
    #[error("string field exceeds {} bytes", u16::MAX)]
    StringTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connectivity check addressed to the receiver's credential fragment.
    Probe { ufrag: String, from_ufrag: String },
    ProbeAck { ufrag: String },
    /// Pre-negotiated channel agreement: "I have this id with this label".
    Announce {
        stream: u16,
        label: String,
        kind: PayloadKind,
    },
    /// In-band channel creation request.
    Open {
        stream: u16,
        label: String,
        kind: PayloadKind,
    },
    OpenAck { stream: u16 },
    Close { stream: u16 },
    CloseAck { stream: u16 },
    Data {
        stream: u16,
        kind: PayloadKind,
        fragment: Fragment,
    },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Probe { .. } => "probe",
            Frame::ProbeAck { .. } => "probe_ack",
            Frame::Announce { .. } => "announce",
            Frame::Open { .. } => "open",
            Frame::OpenAck { .. } => "open_ack",
            Frame::Close { .. } => "close",
            Frame::CloseAck { .. } => "close_ack",
            Frame::Data { .. } => "data",
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FRAME_VERSION);
        match self {
            Frame::Probe { ufrag, from_ufrag } => {
                buf.put_u8(TAG_PROBE);
                put_str(&mut buf, ufrag)?;
                put_str(&mut buf, from_ufrag)?;
            }
            Frame::ProbeAck { ufrag } => {
                buf.put_u8(TAG_PROBE_ACK);
                put_str(&mut buf, ufrag)?;
            }
            Frame::Announce {
                stream,
                label,
                kind,
            } => {
                buf.put_u8(TAG_ANNOUNCE);
                buf.put_u16(*stream);
                buf.put_u8(kind_to_wire(*kind));
                put_str(&mut buf, label)?;
            }
            Frame::Open {
                stream,
                label,
                kind,
            } => {
                buf.put_u8(TAG_OPEN);
                buf.put_u16(*stream);
                buf.put_u8(kind_to_wire(*kind));
                put_str(&mut buf, label)?;
            }
            Frame::OpenAck { stream } => {
                buf.put_u8(TAG_OPEN_ACK);
                buf.put_u16(*stream);
            }
            Frame::Close { stream } => {
                buf.put_u8(TAG_CLOSE);
                buf.put_u16(*stream);
            }
            Frame::CloseAck { stream } => {
                buf.put_u8(TAG_CLOSE_ACK);
                buf.put_u16(*stream);
            }
            Frame::Data {
                stream,
                kind,
                fragment,
            } => {
                buf.reserve(fragment.payload.len() + 19);
                buf.put_u8(TAG_DATA);
                buf.put_u16(*stream);
                buf.put_u8(kind_to_wire(*kind));
                buf.put_u64(fragment.msg_id);
                buf.put_u32(fragment.seq);
                buf.put_u32(fragment.total);
                buf.put_slice(&fragment.payload);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let version = bytes.get_u8();
        if version != FRAME_VERSION {
            return Err(FrameError::Version(version));
        }
        let tag = take_u8(&mut bytes, "tag")?;
        let frame = match tag {
            TAG_PROBE => Frame::Probe {
                ufrag: take_str(&mut bytes, "ufrag")?,
                from_ufrag: take_str(&mut bytes, "from_ufrag")?,
            },
            TAG_PROBE_ACK => Frame::ProbeAck {
                ufrag: take_str(&mut bytes, "ufrag")?,
            },
            TAG_ANNOUNCE | TAG_OPEN => {
                let stream = take_u16(&mut bytes, "stream")?;
                let kind = kind_from_wire(take_u8(&mut bytes, "kind")?)?;
                let label = take_str(&mut bytes, "label")?;
                if tag == TAG_ANNOUNCE {
                    Frame::Announce {
                        stream,
                        label,
                        kind,
                    }
                } else {
                    Frame::Open {
                        stream,
                        label,
                        kind,
                    }
                }
            }
            TAG_OPEN_ACK => Frame::OpenAck {
                stream: take_u16(&mut bytes, "stream")?,
            },
            TAG_CLOSE => Frame::Close {
                stream: take_u16(&mut bytes, "stream")?,
            },
            TAG_CLOSE_ACK => Frame::CloseAck {
                stream: take_u16(&mut bytes, "stream")?,
            },
            TAG_DATA => {
                let stream = take_u16(&mut bytes, "stream")?;
                let kind = kind_from_wire(take_u8(&mut bytes, "kind")?)?;
                if bytes.remaining() < 16 {
                    return Err(FrameError::Truncated("fragment header"));
                }
                let msg_id = bytes.get_u64();
                let seq = bytes.get_u32();
                let total = bytes.get_u32();
                let payload = bytes.copy_to_bytes(bytes.remaining());
                Frame::Data {
                    stream,
                    kind,
                    fragment: Fragment {
                        msg_id,
                        seq,
                        total,
                        payload,
                    },
                }
            }
            other => return Err(FrameError::UnknownTag(other)),
        };
        Ok(frame)
    }
}

fn kind_to_wire(kind: PayloadKind) -> u8 {
    match kind {
        PayloadKind::Text => 0,
        PayloadKind::Binary => 1,
    }
}

fn kind_from_wire(value: u8) -> Result<PayloadKind, FrameError> {
    match value {
        0 => Ok(PayloadKind::Text),
        1 => Ok(PayloadKind::Binary),
        other => Err(FrameError::InvalidKind(other)),
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<(), FrameError> {
    let len = u16::try_from(value.len()).map_err(|_| FrameError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_u8(bytes: &mut Bytes, field: &'static str) -> Result<u8, FrameError> {
    if bytes.remaining() < 1 {
        return Err(FrameError::Truncated(field));
    }
    Ok(bytes.get_u8())
}

fn take_u16(bytes: &mut Bytes, field: &'static str) -> Result<u16, FrameError> {
    if bytes.remaining() < 2 {
        return Err(FrameError::Truncated(field));
    }
    Ok(bytes.get_u16())
}

fn take_str(bytes: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    let len = take_u16(bytes, field)? as usize;
    if bytes.remaining() < len {
        return Err(FrameError::Truncated(field));
    }
    let raw = bytes.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}
