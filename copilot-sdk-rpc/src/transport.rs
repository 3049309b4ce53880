//! Byte transports carrying newline-delimited JSON-RPC frames.
//!
//! A [`Transport`] owns one duplex channel to the engine: the piped stdio of
//! a child process, a TCP socket, or any async reader/writer pair (used by
//! tests with [`tokio::io::duplex`]). It is split into a [`FrameReader`] that
//! the router's reader task drains and a [`FrameWriter`] shared by senders.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Child;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A duplex byte channel to the engine, not yet split.
pub struct Transport {
    reader: BoxedRead,
    writer: BoxedWrite,
    label: String,
}

impl Transport {
    /// Wrap an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            label: label.into(),
        }
    }

    /// Take the piped stdin/stdout of a spawned child.
    ///
    /// The child must have been spawned with `Stdio::piped()` for both
    /// streams. Stderr is left untouched; it is never protocol.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture engine stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture engine stdout"))?;
        let label = match child.id() {
            Some(pid) => format!("stdio(pid={pid})"),
            None => "stdio".to_string(),
        };
        Ok(Self::new(stdout, stdin, label))
    }

    /// Open a TCP connection to `host:port`.
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(read_half, write_half, format!("tcp({host}:{port})")))
    }

    /// Human-readable description used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Split into the reading and writing halves.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        (
            FrameReader {
                inner: BufReader::new(self.reader),
                line: String::new(),
            },
            FrameWriter {
                inner: self.writer,
                closed: false,
            },
        )
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Reading half: yields one trimmed, non-empty line per frame.
pub struct FrameReader {
    inner: BufReader<BoxedRead>,
    line: String,
}

impl FrameReader {
    /// Receive the next frame, or `None` once the peer closed the stream.
    pub async fn receive(&mut self) -> io::Result<Option<String>> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

/// Writing half: writes one newline-terminated frame at a time.
pub struct FrameWriter {
    inner: BoxedWrite,
    closed: bool,
}

impl FrameWriter {
    /// Send a single serialized message as one line.
    pub async fn send(&mut self, frame: &str) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport already closed",
            ));
        }
        debug_assert!(!frame.contains('\n'), "frames must be single-line JSON");
        self.inner.write_all(frame.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Shut the write side down; later sends fail with `BrokenPipe`.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            log::debug!("RPC: transport shutdown error (ignored): {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
