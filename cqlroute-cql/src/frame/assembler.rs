//! Incremental reconstruction of frames from an arbitrarily chunked byte stream.
//!
//! Bytes are appended to an internal buffer as they arrive. Each call to
//! [`FrameAssembler::next_frame`] either yields a complete frame or reports
//! that more input is needed. A chunk can end in the middle of a header,
//! in the middle of a body, or carry several frames at once.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame_errors::{FrameError, FrameHeaderParseError};
use super::header::{header_len_for_version_byte, FrameHeader, MAX_FRAME_LENGTH};
use super::{decompress, flag, Compression};

/// A complete frame.
///
/// `body` is always uncompressed: if the frame arrived compressed it has
/// been inflated and the compression flag cleared from `header.flags`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

#[derive(Debug)]
enum State {
    AwaitingHeader,
    AwaitingBody(FrameHeader),
    Poisoned,
}

#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    state: State,
    compression: Option<Compression>,
    max_frame_length: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FrameAssembler {
    pub fn new(compression: Option<Compression>) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::AwaitingHeader,
            compression,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Lowers the accepted body size. Values above the protocol limit are clamped.
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max.min(MAX_FRAME_LENGTH);
        self
    }

    /// Sets the algorithm used for frames flagged as compressed.
    /// Compression is negotiated after the first frames are exchanged,
    /// so this may change during the assembler's lifetime.
    pub fn set_compression(&mut self, compression: Option<Compression>) {
        self.compression = compression;
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Appends received bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of received bytes not yet returned as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. Errors are fatal: once one is
    /// returned, every later call fails with [`FrameError::AssemblerPoisoned`].
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let result = self.try_next_frame();
        if result.is_err() {
            self.state = State::Poisoned;
            self.buffer.clear();
        }
        result
    }

    fn try_next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                State::Poisoned => return Err(FrameError::AssemblerPoisoned),
                State::AwaitingHeader => {
                    let Some(&first) = self.buffer.first() else {
                        return Ok(None);
                    };
                    let header_len = header_len_for_version_byte(first)?;
                    if self.buffer.len() < header_len {
                        return Ok(None);
                    }
                    let raw_header = self.buffer.split_to(header_len);
                    let header = FrameHeader::decode(&mut &raw_header[..])?;
                    if header.length > self.max_frame_length {
                        return Err(FrameHeaderParseError::FrameTooLarge {
                            length: header.length,
                            max: self.max_frame_length,
                        }
                        .into());
                    }
                    self.buffer.reserve(header.length);
                    self.state = State::AwaitingBody(header);
                }
                State::AwaitingBody(header) => {
                    if self.buffer.len() < header.length {
                        return Ok(None);
                    }
                    let raw_body = self.buffer.split_to(header.length).freeze();
                    self.state = State::AwaitingHeader;
                    return self.finish_frame(header, raw_body).map(Some);
                }
            }
        }
    }

    fn finish_frame(&self, mut header: FrameHeader, raw_body: Bytes) -> Result<Frame, FrameError> {
        if header.flags & flag::COMPRESSION == 0 {
            return Ok(Frame {
                header,
                body: raw_body,
            });
        }
        let compression = self
            .compression
            .ok_or(FrameError::NoCompressionNegotiated)?;
        let body = decompress(&raw_body, compression)?;
        header.flags &= !flag::COMPRESSION;
        Ok(Frame {
            header,
            body: body.into(),
        })
    }

    /// Drains every complete frame currently buffered.
    ///
    /// The iterator stops at the first incomplete frame and can be
    /// created again after more bytes have been fed.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { assembler: self }
    }

    /// Reads from `reader` until a whole frame is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    /// Cancel safe: bytes already read stay buffered in the assembler.
    pub async fn read_frame(
        &mut self,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() && matches!(self.state, State::AwaitingHeader) {
                    return Ok(None);
                }
                let expected = match self.state {
                    State::AwaitingBody(header) => header.length,
                    _ => 0,
                };
                return Err(FrameError::ConnectionClosed {
                    expected,
                    received: self.buffer.len(),
                });
            }
        }
    }
}

pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.assembler.state, State::Poisoned) {
            return None;
        }
        self.assembler.next_frame().transpose()
    }
}
