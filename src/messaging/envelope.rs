use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct HeaderFlags: u8 {
        const MASK_CATEGORY = 0b0000_1111;

        const MANAGEMENT = 0b0000_0001;
        const DATA       = 0b0000_0010;

        const ACK        = 0b1000_0000;
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, Eq, PartialEq)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Category {
    Management,
    Data,
}
impl Category {
    fn flags(&self) -> HeaderFlags {
        match self {
            Category::Management => HeaderFlags::MANAGEMENT,
            Category::Data => HeaderFlags::DATA,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageKind {
    Greet = 1,
    Farewell = 2,
    Ping = 3,
    Data = 4,
}
impl MessageKind {
    pub fn category(&self) -> Category {
        match self {
            MessageKind::Greet | MessageKind::Farewell | MessageKind::Ping => Category::Management,
            MessageKind::Data => Category::Data,
        }
    }
}

/// A single datagram's content: a fixed 10 byte header followed by an opaque payload.
///
/// ```ascii
/// 0: category flags | ack flag
/// 1: message kind
/// 2-9: message id (u64 LE)
/// 10..: payload
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Envelope {
    pub category: Category,
    pub is_ack: bool,
    pub kind: MessageKind,
    pub id: u64,
    pub payload: Bytes,
}
impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{{:?}{}#{}:{:?}, {} bytes}}",
               self.kind,
               if self.is_ack { "-ACK" } else { "" },
               self.id,
               self.category,
               self.payload.len(),
        )
    }
}

impl Envelope {
    pub const HEADER_LEN: usize = 10;

    pub fn new(kind: MessageKind, id: u64, payload: Bytes) -> Envelope {
        Envelope {
            category: kind.category(),
            is_ack: false,
            kind,
            id,
            payload,
        }
    }

    /// The acknowledgement for this envelope: same category, kind and id, no payload
    pub fn ack(&self) -> Envelope {
        Envelope {
            category: self.category,
            is_ack: true,
            kind: self.kind,
            id: self.id,
            payload: Bytes::new(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = self.category.flags();
        if self.is_ack {
            flags |= HeaderFlags::ACK;
        }
        buf.put_u8(flags.bits());
        buf.put_u8(self.kind.into());
        buf.put_u64_le(self.id);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> Result<Envelope, WireError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(WireError::Malformed("shorter than header"));
        }

        let flags = HeaderFlags::from_bits_retain(buf.get_u8());
        let raw_kind = buf.get_u8();
        let id = buf.get_u64_le();

        if !(HeaderFlags::MASK_CATEGORY | HeaderFlags::ACK).contains(flags) {
            return Err(WireError::Malformed("unknown flag bits"));
        }

        let category_flags = flags & HeaderFlags::MASK_CATEGORY;
        let category = if category_flags == HeaderFlags::MANAGEMENT {
            Category::Management
        }
        else if category_flags == HeaderFlags::DATA {
            Category::Data
        }
        else {
            return Err(WireError::Malformed("unknown category"));
        };
        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| WireError::Malformed("unknown message kind"))?;
        if kind.category() != category {
            return Err(WireError::Malformed("message kind does not match category"));
        }

        Ok(Envelope {
            category,
            is_ack: flags.contains(HeaderFlags::ACK),
            kind,
            id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
