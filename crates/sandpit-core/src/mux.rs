//! Stream multiplexer
//!
//! Adapts a message transport into the three byte streams a program needs.
//! Inbound text frames `{"msg", "eof"}` become an [`AsyncRead`] for stdin.
//! Two [`FrameWriter`]s turn stdout and stderr writes into
//! `{"msg", "isStderr"}` frames on one shared channel, which a single
//! transport writer drains so frames never interleave on the wire.
//!
//! Nothing here knows about websockets; the server maps its messages onto
//! [`InboundFrame`] and sends whatever arrives on the output channel.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sandpit_types::{close_code, OutputFrame, StdinFrame};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

/// One message received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    /// The peer closed the connection, with its close code if it sent one
    Closed { code: Option<u16> },
}

impl InboundFrame {
    /// Whether this frame ends the connection without an error
    pub fn is_benign_close(&self) -> bool {
        match self {
            InboundFrame::Closed { code } => is_benign_close_code(*code),
            _ => false,
        }
    }
}

fn is_benign_close_code(code: Option<u16>) -> bool {
    matches!(
        code,
        None | Some(close_code::NORMAL) | Some(close_code::GOING_AWAY)
    )
}

type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Program stdin backed by inbound frames
///
/// Reads return data as it arrives and end of stream after the frame marked
/// `eof`. A binary or malformed frame, or an abnormal close, is a read error
/// after which the stream is exhausted.
pub struct StdinReader {
    inner: StreamReader<ChunkStream, Bytes>,
}

impl StdinReader {
    pub fn new<S>(frames: S) -> Self
    where
        S: Stream<Item = InboundFrame> + Send + 'static,
    {
        let chunks: ChunkStream = Box::pin(decode_stdin(frames));
        Self {
            inner: StreamReader::new(chunks),
        }
    }

    /// Reader fed from a channel of frames; dropping every sender ends input.
    pub fn from_channel(frames: mpsc::Receiver<InboundFrame>) -> Self {
        Self::new(receiver_stream(frames))
    }
}

fn receiver_stream(mut rx: mpsc::Receiver<InboundFrame>) -> impl Stream<Item = InboundFrame> {
    async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield frame;
        }
    }
}

fn decode_stdin<S>(frames: S) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = InboundFrame> + Send + 'static,
{
    async_stream::stream! {
        let mut frames = Box::pin(frames);
        while let Some(frame) = frames.next().await {
            match frame {
                InboundFrame::Text(text) => match serde_json::from_str::<StdinFrame>(&text) {
                    Ok(frame) => {
                        if !frame.msg.is_empty() {
                            yield Ok(Bytes::from(frame.msg));
                        }
                        if frame.eof {
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("malformed stdin frame: {}", e),
                        ));
                        break;
                    }
                },
                InboundFrame::Binary(_) => {
                    yield Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "binary frames are not accepted on stdin",
                    ));
                    break;
                }
                InboundFrame::Closed { code } => {
                    if !is_benign_close_code(code) {
                        yield Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("connection closed with code {:?}", code),
                        ));
                    }
                    break;
                }
            }
        }
    }
}

impl AsyncRead for StdinReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Output sink that turns every write into one frame
///
/// Bytes that end in the middle of a UTF-8 sequence are held back until the
/// next write so multi-byte characters are never split across frames.
pub struct FrameWriter {
    sender: PollSender<OutputFrame>,
    is_stderr: bool,
    carry: Vec<u8>,
}

/// Stdout and stderr writers sharing one outbound frame channel
pub struct OutputChannels {
    pub stdout: FrameWriter,
    pub stderr: FrameWriter,
    /// Ends once both writers are shut down or dropped
    pub frames: mpsc::Receiver<OutputFrame>,
}

impl FrameWriter {
    /// Create both writers and the channel they feed.
    pub fn channels(capacity: usize) -> OutputChannels {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        OutputChannels {
            stdout: FrameWriter::new(tx.clone(), false),
            stderr: FrameWriter::new(tx, true),
            frames,
        }
    }

    pub fn new(sender: mpsc::Sender<OutputFrame>, is_stderr: bool) -> Self {
        Self {
            sender: PollSender::new(sender),
            is_stderr,
            carry: Vec::new(),
        }
    }

    pub fn is_stderr(&self) -> bool {
        self.is_stderr
    }

    fn frame(&self, msg: String) -> OutputFrame {
        OutputFrame {
            msg,
            is_stderr: self.is_stderr,
        }
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed")
}

/// Index where a trailing, incomplete UTF-8 sequence starts.
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if len - i < needed { i } else { len };
    }
    len
}

impl AsyncWrite for FrameWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut pending = Vec::with_capacity(this.carry.len() + buf.len());
        pending.extend_from_slice(&this.carry);
        pending.extend_from_slice(buf);
        let split = incomplete_tail_start(&pending);
        if split == 0 {
            this.carry = pending;
            return Poll::Ready(Ok(buf.len()));
        }

        ready!(this.sender.poll_reserve(cx)).map_err(|_| channel_closed())?;

        let tail = pending.split_off(split);
        let msg = match String::from_utf8(pending) {
            Ok(msg) => msg,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        let frame = this.frame(msg);
        this.sender.send_item(frame).map_err(|_| channel_closed())?;
        this.carry = tail;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.carry.is_empty() {
            if ready!(this.sender.poll_reserve(cx)).is_ok() {
                let msg = String::from_utf8_lossy(&this.carry).into_owned();
                let frame = this.frame(msg);
                let _ = this.sender.send_item(frame);
            }
            this.carry.clear();
        }
        this.sender.close();
        Poll::Ready(Ok(()))
    }
}
