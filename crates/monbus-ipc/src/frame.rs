//! Frame codec
//!
//! A frame is an 8 byte header (message code, payload size; both u32 in
//! native byte order) followed by `size` payload bytes. Both ends of a
//! socket run on the same host and are built from the same tree, so the
//! header carries no version or checksum.
//!
//! Every function here tolerates partial I/O: on a non-blocking socket a
//! short read or write is a normal outcome reported through byte counts.

use std::fmt;
use std::io::{self, Read, Write};

use monbus_util::{IpcLimits, FRAME_HEADER_SIZE};

use crate::{IpcError, IpcResult};

/// Frames up to this size are written with a single syscall
const SCRATCH_SIZE: usize = 4096;

/// Number of payload bytes shown by `Message`'s `Display`
const DISPLAY_BYTES: usize = 16;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: u32,
    pub size: u32,
}

impl FrameHeader {
    pub fn new(code: u32, size: u32) -> Self {
        Self { code, size }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.code.to_ne_bytes());
        bytes[4..].copy_from_slice(&self.size.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let [c0, c1, c2, c3, s0, s1, s2, s3] = *bytes;
        Self {
            code: u32::from_ne_bytes([c0, c1, c2, c3]),
            size: u32::from_ne_bytes([s0, s1, s2, s3]),
        }
    }
}

/// A complete message: code plus owned payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: u32,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(code: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Message without payload
    pub fn empty(code: u32) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Display for Message {
    /// `code:1 size:4 data:70 69 6e 67`, payload truncated to a few bytes
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code:{} size:{} data:", self.code, self.payload.len())?;
        for (i, byte) in self.payload.iter().take(DISPLAY_BYTES).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        if self.payload.len() > DISPLAY_BYTES {
            f.write_str(" ...")?;
        }
        Ok(())
    }
}

/// Size field for `payload`, rejecting payloads the header cannot describe
pub(crate) fn frame_size(payload: &[u8]) -> IpcResult<u32> {
    u32::try_from(payload.len()).map_err(|_| IpcError::MessageTooLarge {
        size: payload.len() as u64,
        max: u32::MAX,
    })
}

/// Write a framed message.
///
/// Returns the number of bytes that went through, which is less than the
/// frame length when a non-blocking writer ran out of room. Small frames
/// are assembled in a scratch buffer and written with one call.
pub fn write_message<W: Write>(writer: &mut W, code: u32, payload: &[u8]) -> IpcResult<usize> {
    let size = frame_size(payload)?;
    let header = FrameHeader::new(code, size).to_bytes();
    let total = FRAME_HEADER_SIZE + payload.len();

    if total <= SCRATCH_SIZE {
        let mut scratch = [0u8; SCRATCH_SIZE];
        scratch[..FRAME_HEADER_SIZE].copy_from_slice(&header);
        scratch[FRAME_HEADER_SIZE..total].copy_from_slice(payload);
        return Ok(write_some(writer, &scratch[..total])?);
    }

    let written = write_some(writer, &header)?;
    if written < FRAME_HEADER_SIZE {
        return Ok(written);
    }

    Ok(written + write_some(writer, payload)?)
}

/// Write as much of `buf` as the writer accepts without blocking
pub(crate) fn write_some<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;

    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    Ok(written)
}

/// Read until `buf` is full or the reader would block.
///
/// Returns the number of bytes read, possibly 0 on a non-blocking reader.
/// End of stream is an error: the peer closed the connection.
pub fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> IpcResult<usize> {
    let mut read = 0;

    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Err(IpcError::ConnectionClosed),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(read)
}

/// Single read into `buf`. `None` when the reader would block.
pub(crate) fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> IpcResult<Option<usize>> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Err(IpcError::ConnectionClosed),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Incremental decoder assembling one frame from arbitrary chunks
#[derive(Debug)]
pub struct FrameAssembler {
    header_bytes: [u8; FRAME_HEADER_SIZE],
    header: Option<FrameHeader>,
    payload: Vec<u8>,
    /// Header plus payload bytes received so far
    consumed: usize,
    limits: IpcLimits,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_limits(&IpcLimits::default())
    }

    /// Assembler rejecting frames that `limits` does not accept
    pub fn with_limits(limits: &IpcLimits) -> Self {
        Self {
            header_bytes: [0; FRAME_HEADER_SIZE],
            header: None,
            payload: Vec::new(),
            consumed: 0,
            limits: *limits,
        }
    }

    /// Feed bytes to the decoder and return how many were used.
    ///
    /// Stops at the end of the current frame, so the unused tail of
    /// `chunk` belongs to the next frame. The payload buffer is allocated
    /// once, when the header is complete.
    pub fn parse_from_buffer(&mut self, chunk: &[u8]) -> IpcResult<usize> {
        let mut used = 0;

        if self.header.is_none() {
            let n = (FRAME_HEADER_SIZE - self.consumed).min(chunk.len());
            self.header_bytes[self.consumed..self.consumed + n].copy_from_slice(&chunk[..n]);
            self.consumed += n;
            used += n;

            if self.consumed < FRAME_HEADER_SIZE {
                return Ok(used);
            }

            let header = FrameHeader::from_bytes(&self.header_bytes);
            if !self.limits.accepts(header.size) {
                return Err(IpcError::MessageTooLarge {
                    size: u64::from(header.size),
                    max: self.limits.max_message_size.unwrap_or(u32::MAX),
                });
            }
            self.payload = vec![0; header.size as usize];
            self.header = Some(header);
        }

        let n = self.remaining().min(chunk.len() - used);
        let offset = self.consumed - FRAME_HEADER_SIZE;
        self.payload[offset..offset + n].copy_from_slice(&chunk[used..used + n]);
        self.consumed += n;

        Ok(used + n)
    }

    pub fn header_complete(&self) -> bool {
        self.header.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.header.is_some() && self.remaining() == 0
    }

    /// Bytes missing from the current part (header or payload)
    pub fn remaining(&self) -> usize {
        match self.header {
            None => FRAME_HEADER_SIZE - self.consumed,
            Some(_) => self.payload.len() + FRAME_HEADER_SIZE - self.consumed,
        }
    }

    /// Unfilled tail of the payload, for reads that skip the read buffer
    pub(crate) fn payload_tail_mut(&mut self) -> &mut [u8] {
        let offset = self.consumed.saturating_sub(FRAME_HEADER_SIZE);
        &mut self.payload[offset..]
    }

    /// Account for `n` bytes written through `payload_tail_mut`
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.header.is_some() && n <= self.remaining());
        self.consumed += n;
    }

    /// Take the assembled message and reset for the next frame
    pub fn take_message(&mut self) -> Option<Message> {
        if !self.is_complete() {
            return None;
        }

        let header = self.header.take()?;
        self.consumed = 0;
        Some(Message::new(header.code, std::mem::take(&mut self.payload)))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound frame that may need several writes to go through
#[derive(Debug)]
pub(crate) struct OutgoingFrame {
    header: [u8; FRAME_HEADER_SIZE],
    payload: Vec<u8>,
    sent: usize,
}

impl OutgoingFrame {
    /// Frame of which `sent` bytes already reached the socket
    pub fn partially_sent(code: u32, payload: Vec<u8>, sent: usize) -> Self {
        // Callers validate the size before anything is written
        let header = FrameHeader::new(code, payload.len() as u32).to_bytes();
        Self {
            header,
            payload,
            sent,
        }
    }

    pub fn from_message(message: Message) -> Self {
        Self::partially_sent(message.code, message.payload, 0)
    }

    pub fn remaining(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() - self.sent
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Write the rest of the header, then the rest of the payload
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> IpcResult<()> {
        if self.sent < FRAME_HEADER_SIZE {
            self.sent += write_some(writer, &self.header[self.sent..])?;
            if self.sent < FRAME_HEADER_SIZE {
                return Ok(());
            }
        }

        let offset = self.sent - FRAME_HEADER_SIZE;
        self.sent += write_some(writer, &self.payload[offset..])?;

        Ok(())
    }
}
