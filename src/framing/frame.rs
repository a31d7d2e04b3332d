use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::framing::crc::crc16;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Marker that starts every frame on the serial link
pub const PREAMBLE: [u8; 4] = [0xCF, 0xEB, 0x01, 0x81];

/// Written after the checksum. It carries no protocol meaning and is not validated when reading.
pub const TERMINATOR: u8 = 10;

/// checksum (u16) + terminator (u8)
pub const TRAILER_LEN: usize = size_of::<u16>() + size_of::<u8>();

/// The fixed part of a frame between preamble and payload. All numbers are little endian:
///
/// ```ascii
/// 0: payload length (u16)
/// 2: address id (u8)
/// 3: port a (u16)
/// 5: port b (u16)
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub payload_len: u16,
    pub address_id: u8,
    pub port_a: u16,
    pub port_b: u16,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<u8>() + size_of::<u16>() + size_of::<u16>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.payload_len);
        buf.put_u8(self.address_id);
        buf.put_u16_le(self.port_a);
        buf.put_u16_le(self.port_b);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("frame header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }
        Ok(Self::get(buf))
    }

    /// NB: panics if fewer than [FrameHeader::SERIALIZED_LEN] bytes remain, like [Buf::get_u8] etc.
    pub(crate) fn get(buf: &mut impl Buf) -> FrameHeader {
        FrameHeader {
            payload_len: buf.get_u16_le(),
            address_id: buf.get_u8(),
            port_a: buf.get_u16_le(),
            port_b: buf.get_u16_le(),
        }
    }
}

/// One application datagram as it travels over the serial link.
///
/// `port_a` is the application facing port: the loopback port to deliver to for a frame
///  coming from the serial link, and the port the reply came from for a frame going to it.
///  `(address_id, port_b)` identifies the session regardless of direction.
///
/// Outside this crate, frames are created through [Frame::new] only, so the payload length
///  always fits the header's length field.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub(crate) address_id: u8,
    pub(crate) port_a: u16,
    pub(crate) port_b: u16,
    pub(crate) payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAME{{{}:{}->{} [{} bytes]}}", self.address_id, self.port_b, self.port_a, self.payload.len())
    }
}

impl Frame {
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

    pub fn new(address_id: u8, port_a: u16, port_b: u16, payload: impl Into<Bytes>) -> anyhow::Result<Frame> {
        let payload = payload.into();
        if payload.len() > Self::MAX_PAYLOAD_LEN {
            bail!("frame payload has a maximum length of {} bytes, was {}", Self::MAX_PAYLOAD_LEN, payload.len());
        }

        Ok(Frame {
            address_id,
            port_a,
            port_b,
            payload,
        })
    }

    pub fn address_id(&self) -> u8 {
        self.address_id
    }

    pub fn port_a(&self) -> u16 {
        self.port_a
    }

    pub fn port_b(&self) -> u16 {
        self.port_b
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            payload_len: self.payload.len().prechecked_cast(),
            address_id: self.address_id,
            port_a: self.port_a,
            port_b: self.port_b,
        }
    }

    pub fn serialized_len(&self) -> usize {
        PREAMBLE.len() + FrameHeader::SERIALIZED_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Checksum over the serialized header followed by `payload`
    pub fn checksum(header: &FrameHeader, payload: &[u8]) -> u16 {
        let mut header_buf = [0u8; FrameHeader::SERIALIZED_LEN];
        header.ser(&mut &mut header_buf[..]);
        crc16(payload, crc16(&header_buf, 0))
    }

    /// Writes the complete frame, i.e. the unit that goes to the serial link in a single write
    pub fn ser(&self, buf: &mut BytesMut) {
        let header = self.header();

        buf.reserve(self.serialized_len());
        buf.put_slice(&PREAMBLE);
        header.ser(buf);
        buf.put_slice(&self.payload);
        buf.put_u16_le(Self::checksum(&header, &self.payload));
        buf.put_u8(TERMINATOR);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn payload_len(&self) -> usize {
        self.header().payload_len.safe_cast()
    }
}
