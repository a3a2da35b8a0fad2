//! Buffered socket wrapper
//!
//! A connection owns a unix stream and a fixed-size read-ahead buffer. One
//! `read()` may fetch several small frames at once; the buffer keeps the
//! surplus for the next frame. Large payload remainders are read straight
//! into the message to avoid copying them twice.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use monbus_util::IpcLimits;
use tracing::error;

use crate::frame::{self, FrameAssembler, OutgoingFrame};
use crate::{IpcError, IpcResult};

pub(crate) struct Connection {
    stream: UnixStream,
    buffer: Box<[u8]>,
    /// Bytes of `buffer` holding data
    filled: usize,
    /// Bytes of `buffer` already handed to the decoder
    consumed: usize,
    bypass_threshold: usize,
}

impl Connection {
    pub fn new(stream: UnixStream, limits: &IpcLimits) -> Self {
        Self {
            stream,
            buffer: vec![0; limits.read_buffer_size].into_boxed_slice(),
            filled: 0,
            consumed: 0,
            bypass_threshold: limits.bypass_threshold(),
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Switch the socket to non-blocking mode.
    ///
    /// An event loop driving a blocking socket would stall, so failure
    /// here is fatal for the caller.
    pub fn set_nonblocking(&self) -> IpcResult<()> {
        self.stream.set_nonblocking(true).map_err(|e| {
            error!(error = %e, "Cannot switch IPC socket to non-blocking mode");
            IpcError::NonBlocking(e)
        })
    }

    /// Feed socket data to `frame` until it is complete or the socket
    /// would block.
    ///
    /// Returns `true` when `frame` holds a complete message. Buffered bytes
    /// are drained before the kernel is asked for more.
    pub fn read_frame(&mut self, frame: &mut FrameAssembler) -> IpcResult<bool> {
        loop {
            if self.consumed < self.filled {
                let used = frame.parse_from_buffer(&self.buffer[self.consumed..self.filled])?;
                self.consumed += used;
                if frame.is_complete() {
                    return Ok(true);
                }
            }

            // The decoder took every buffered byte without completing
            self.consumed = 0;
            self.filled = 0;

            if frame.header_complete() && frame.remaining() >= self.bypass_threshold {
                let want = frame.remaining();
                let read = frame::read_exact(&mut self.stream, frame.payload_tail_mut())?;
                frame.advance(read);
                return Ok(read == want);
            }

            match frame::read_some(&mut self.stream, &mut self.buffer)? {
                Some(n) => self.filled = n,
                None => return Ok(false),
            }
        }
    }

    /// Single attempt to write a framed message, see `frame::write_message`
    pub fn write_message(&mut self, code: u32, payload: &[u8]) -> IpcResult<usize> {
        frame::write_message(&mut self.stream, code, payload)
    }

    /// Continue writing a partially sent frame
    pub fn flush(&mut self, frame: &mut OutgoingFrame) -> IpcResult<()> {
        frame.flush(&mut self.stream)
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
