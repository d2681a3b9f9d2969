// ABOUTME: Provides buffered frame-based I/O over an abstract duplex byte stream
// ABOUTME: Splits into a reading half and a writing half so the session's two tasks can own them

//! Transport framing.
//!
//! The engine consumes its transport as a plain byte stream: anything
//! implementing `AsyncRead + AsyncWrite` works, whether that is a
//! `TcpStream`, a TLS wrapper or an in-memory duplex pipe in tests. No
//! packet boundaries are assumed; the read side accumulates bytes until
//! the codec reports a complete frame.

use crate::error::BeepResult;
use crate::frame::{Frame, SeqFrame, WireFrame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Reading half: pulls bytes from the transport and yields parsed frames.
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,

    // The buffer for reading frames.
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> FrameReader<R> {
        FrameReader {
            io,
            // Default to a 4KB read buffer, matching the protocol's
            // initial receive window. The buffer grows as larger windows
            // are advertised.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read a single frame from the underlying stream.
    ///
    /// The function waits until it has retrieved enough data to parse a
    /// frame. Any data remaining in the read buffer after the frame has
    /// been parsed is kept there for the next call.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the stream is
    /// closed in a way that doesn't break a frame in half, it returns
    /// `None`. Otherwise, an error is returned.
    pub async fn read_frame(&mut self) -> BeepResult<Option<WireFrame>> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough
            // data has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // There is not enough buffered data to read a frame. Attempt
            // to read more data from the transport. `0` indicates "end of
            // stream".
            if 0 == self.io.read_buf(&mut self.buffer).await? {
                // The remote closed the connection. For this to be a
                // clean shutdown, there should be no data left in the
                // read buffer; a partial frame means the peer died
                // mid-send.
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )
                .into());
            }
        }
    }

    /// Tries to parse a frame from the buffer. If the buffer contains
    /// enough data, the frame is returned and the data removed from the
    /// buffer. If not enough data has been buffered yet, `Ok(None)` is
    /// returned. If the buffered data does not represent a valid frame,
    /// `Err` is returned.
    fn parse_frame(&mut self) -> BeepResult<Option<WireFrame>> {
        use crate::frame::FrameError::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // `check` is cheap relative to a full parse and tells us the
        // total frame length, so we only allocate frame structures once
        // the whole frame has been received.
        match WireFrame::check(&mut buf) {
            Ok(len) => {
                buf.set_position(0);

                // A `check` success guarantees `parse` sees a complete,
                // structurally valid frame; semantic errors still
                // propagate and terminate the session.
                let frame = WireFrame::parse(&mut buf)?;

                // Discard the parsed data from the read buffer.
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // Not enough data buffered for a single frame; the caller
            // will read more from the transport. This "error" is an
            // expected runtime condition.
            Err(Incomplete) => Ok(None),
            // The buffered data is malformed. The session is now in an
            // invalid state and will be torn down by the caller.
            Err(e) => Err(e.into()),
        }
    }
}

/// Writing half: serializes frames into a buffered writer.
#[derive(Debug)]
pub struct FrameWriter<W> {
    // Write-level buffering keeps one syscall per flush rather than one
    // per header, payload and trailer.
    io: BufWriter<W>,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> FrameWriter<W> {
        FrameWriter {
            io: BufWriter::new(io),
            scratch: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Serializes and buffers one data frame. `budget` is the remaining
    /// remote-window capacity; the codec refuses frames that overrun it.
    pub async fn write_data(&mut self, frame: &Frame, budget: usize) -> BeepResult<()> {
        self.scratch.clear();
        frame.encode(&mut self.scratch, budget)?;
        self.io.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Serializes and buffers one SEQ frame.
    pub async fn write_seq(&mut self, seq: &SeqFrame) -> BeepResult<()> {
        self.scratch.clear();
        seq.encode(&mut self.scratch);
        self.io.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Flushes buffered frames out to the transport.
    pub async fn flush(&mut self) -> BeepResult<()> {
        self.io.flush().await?;
        Ok(())
    }
}
