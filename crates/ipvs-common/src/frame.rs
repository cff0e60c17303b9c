//! Request/response framing on the control socket.
//!
//! A request is a 16-byte header followed by `payload_len` bytes. A response
//! is an 8-byte header followed by `payload_len` bytes. `status` is zero on
//! success or a negated errno.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::sockopt::{GetCommand, MAX_ARG_LEN, MAX_REPLY_LEN, SetCommand};

pub const REQUEST_HEADER_LEN: usize = 16;
pub const RESPONSE_HEADER_LEN: usize = 8;

/// Direction of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Set = 0,
    Get = 1,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Set),
            1 => Ok(Self::Get),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// A decoded command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set(SetCommand),
    Get(GetCommand),
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Self::Set(c) => c.name(),
            Self::Get(c) => c.name(),
        }
    }

    pub fn arg_len(self) -> usize {
        match self {
            Self::Set(c) => c.arg_len(),
            Self::Get(c) => c.arg_len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: FrameKind,
    pub cmd: u32,
    pub payload_len: u32,
    /// Reply length declared by the caller. Ignored for set commands.
    pub reply_capacity: u32,
}

impl RequestHeader {
    pub fn set(cmd: SetCommand, payload_len: usize) -> Self {
        Self {
            kind: FrameKind::Set,
            cmd: cmd as u32,
            payload_len: u32::try_from(payload_len).unwrap_or(u32::MAX),
            reply_capacity: 0,
        }
    }

    pub fn get(cmd: GetCommand, payload_len: usize, reply_capacity: usize) -> Self {
        Self {
            kind: FrameKind::Get,
            cmd: cmd as u32,
            payload_len: u32::try_from(payload_len).unwrap_or(u32::MAX),
            reply_capacity: u32::try_from(reply_capacity).unwrap_or(u32::MAX),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.cmd);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(self.reply_capacity);
    }

    /// Decode the header only. Command and length checks are separate so a
    /// bad command still gets a reply rather than a dropped connection.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < REQUEST_HEADER_LEN {
            return Err(WireError::Truncated {
                need: REQUEST_HEADER_LEN,
                have: buf.remaining(),
            });
        }
        let kind = FrameKind::try_from(buf.get_u8())?;
        buf.advance(3);
        Ok(Self {
            kind,
            cmd: buf.get_u32_le(),
            payload_len: buf.get_u32_le(),
            reply_capacity: buf.get_u32_le(),
        })
    }

    pub fn command(&self) -> Result<Command, WireError> {
        match self.kind {
            FrameKind::Set => SetCommand::try_from(self.cmd).map(Command::Set),
            FrameKind::Get => GetCommand::try_from(self.cmd).map(Command::Get),
        }
    }

    /// Reject payloads over the absolute ceiling before reading them.
    pub fn check_ceilings(&self) -> Result<(), WireError> {
        let len = self.payload_len as usize;
        if len > MAX_ARG_LEN {
            return Err(WireError::TooLarge {
                len,
                max: MAX_ARG_LEN,
            });
        }
        let cap = self.reply_capacity as usize;
        if cap > MAX_REPLY_LEN {
            return Err(WireError::TooLarge {
                len: cap,
                max: MAX_REPLY_LEN,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: i32,
    pub payload_len: u32,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.status);
        buf.put_u32_le(self.payload_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < RESPONSE_HEADER_LEN {
            return Err(WireError::Truncated {
                need: RESPONSE_HEADER_LEN,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            status: buf.get_i32_le(),
            payload_len: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn request_header_roundtrip() {
        let hdr = RequestHeader::get(GetCommand::Services, 4, 96);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), REQUEST_HEADER_LEN);
        assert_eq!(&buf[1..4], &[0, 0, 0]);
        let decoded = RequestHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(
            decoded.command().unwrap(),
            Command::Get(GetCommand::Services)
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut raw = [0u8; REQUEST_HEADER_LEN];
        raw[0] = 7;
        assert_eq!(
            RequestHeader::decode(&mut &raw[..]),
            Err(WireError::UnknownKind(7))
        );
    }

    #[test]
    fn set_and_get_namespaces_are_distinct() {
        // 1154 is AddService as a set and Services as a get.
        let set = RequestHeader {
            kind: FrameKind::Set,
            cmd: 1154,
            payload_len: 0,
            reply_capacity: 0,
        };
        let get = RequestHeader {
            kind: FrameKind::Get,
            ..set
        };
        assert_eq!(set.command().unwrap(), Command::Set(SetCommand::AddService));
        assert_eq!(get.command().unwrap(), Command::Get(GetCommand::Services));
    }

    #[test]
    fn ceilings_enforced() {
        let mut hdr = RequestHeader::set(SetCommand::AddService, MAX_ARG_LEN + 1);
        assert!(matches!(
            hdr.check_ceilings(),
            Err(WireError::TooLarge { .. })
        ));
        hdr.payload_len = 40;
        assert!(hdr.check_ceilings().is_ok());
        let big = RequestHeader::get(GetCommand::Services, 4, MAX_REPLY_LEN + 1);
        assert!(big.check_ceilings().is_err());
    }

    #[test]
    fn response_header_roundtrip() {
        let hdr = ResponseHeader {
            status: -22,
            payload_len: 0,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(ResponseHeader::decode(&mut buf.freeze()).unwrap(), hdr);
    }
}
