use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::framing::crc::crc16;
use crate::framing::frame::{Frame, FrameHeader, PREAMBLE, TRAILER_LEN};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeResult {
    /// The input ran out before a frame was complete. The decoder retains its progress, and the
    ///  next call continues where this one left off.
    Incomplete,
    /// A syntactically complete frame whose checksum did not match - the frame is dropped
    ChecksumMismatch { expected: u16, received: u16 },
    Frame(Frame),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum DecoderState {
    SeekingPreamble { matched: usize },
    ReadingHeader,
    ReadingPayload { header: FrameHeader },
    ReadingTrailer { header: FrameHeader },
}

/// Incremental decoder for frames on the serial link. It can be fed arbitrarily fragmented
///  input, down to a single byte per call, and resynchronizes on the preamble after garbage or
///  after a corrupted frame.
///
/// Bytes that turn out not to be part of a preamble are collected as 'noise'. The peer uses
///  this to emit human readable log output between frames.
pub struct FrameDecoder {
    state: DecoderState,
    field_buf: BytesMut,
    payload: Bytes,
    crc: u16,
    noise: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            state: DecoderState::SeekingPreamble { matched: 0 },
            field_buf: BytesMut::new(),
            payload: Bytes::new(),
            crc: 0,
            noise: BytesMut::new(),
        }
    }

    /// Consumes bytes from `buf` until a frame is complete or `buf` is exhausted. Bytes after
    ///  the end of a complete frame are left in `buf` for the next call.
    pub fn decode(&mut self, buf: &mut impl Buf) -> DecodeResult {
        loop {
            match self.state {
                DecoderState::SeekingPreamble { matched } => {
                    if !buf.has_remaining() {
                        return DecodeResult::Incomplete;
                    }
                    self.on_preamble_byte(matched, buf.get_u8());
                }
                DecoderState::ReadingHeader => {
                    if !self.fill(buf, FrameHeader::SERIALIZED_LEN) {
                        return DecodeResult::Incomplete;
                    }
                    let raw = self.field_buf.split().freeze();
                    self.crc = crc16(&raw, 0);
                    let header = FrameHeader::get(&mut raw.clone());
                    self.state = DecoderState::ReadingPayload { header };
                }
                DecoderState::ReadingPayload { header } => {
                    if !self.fill(buf, header.payload_len.safe_cast()) {
                        return DecodeResult::Incomplete;
                    }
                    self.payload = self.field_buf.split().freeze();
                    self.crc = crc16(&self.payload, self.crc);
                    self.state = DecoderState::ReadingTrailer { header };
                }
                DecoderState::ReadingTrailer { header } => {
                    if !self.fill(buf, TRAILER_LEN) {
                        return DecodeResult::Incomplete;
                    }
                    let mut trailer = self.field_buf.split();
                    let received = trailer.get_u16_le();
                    // the terminator is not validated

                    self.state = DecoderState::SeekingPreamble { matched: 0 };
                    let payload = std::mem::take(&mut self.payload);

                    if received != self.crc {
                        return DecodeResult::ChecksumMismatch {
                            expected: self.crc,
                            received,
                        };
                    }

                    let frame = Frame {
                        address_id: header.address_id,
                        port_a: header.port_a,
                        port_b: header.port_b,
                        payload,
                    };
                    trace!("decoded {:?}", frame);
                    return DecodeResult::Frame(frame);
                }
            }
        }
    }

    fn on_preamble_byte(&mut self, matched: usize, b: u8) {
        if b == PREAMBLE[matched] {
            self.state = if matched + 1 == PREAMBLE.len() {
                DecoderState::ReadingHeader
            }
            else {
                DecoderState::SeekingPreamble { matched: matched + 1 }
            };
            return;
        }

        // the bytes matched so far were not a preamble after all
        self.noise.put_slice(&PREAMBLE[..matched]);
        self.noise.put_u8(b);
        self.state = DecoderState::SeekingPreamble { matched: 0 };
    }

    /// Moves bytes from `buf` into `field_buf` until it holds `needed` bytes, returning `true`
    ///  once it does.
    fn fill(&mut self, buf: &mut impl Buf, needed: usize) -> bool {
        let missing = needed - self.field_buf.len();
        let n = missing.min(buf.remaining());
        if n > 0 {
            let chunk = buf.copy_to_bytes(n);
            self.field_buf.put_slice(&chunk);
        }
        self.field_buf.len() == needed
    }

    pub fn has_noise(&self) -> bool {
        !self.noise.is_empty()
    }

    /// Returns the noise collected so far, clearing it
    pub fn take_noise(&mut self) -> Bytes {
        self.noise.split().freeze()
    }

    /// `true` if the decoder is between frames, i.e. not in the middle of a (potential) frame
    pub fn is_idle(&self) -> bool {
        self.state == DecoderState::SeekingPreamble { matched: 0 }
    }
}
