//! Framed transport over a byte stream.
//!
//! One [`Message`] per newline-terminated record. The transport can be used
//! whole (handshakes read and write on the same task) or split into reader
//! and writer halves so a session can run independent reader and writer
//! tasks.

use std::io;

use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;

use crate::message::{Message, ParseError};

/// Upper bound on a single wire record. A peer that exceeds it is not
/// speaking this protocol; the session is torn down.
pub const MAX_RECORD: usize = 1 << 20;

/// Terminal transport outcomes. All of them close the session.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The peer closed the stream (EOF, possibly mid-record).
    #[error("connection closed")]
    Closed,
    /// A record exceeded [`MAX_RECORD`] bytes.
    #[error("record too long")]
    Oversize,
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A framed connection, generic over the underlying stream so tests can run
/// against in-memory duplex pipes.
#[derive(Debug)]
pub struct Conn<S = TcpStream> {
    reader: ConnReader<S>,
    writer: ConnWriter<S>,
}

impl<S: AsyncRead + AsyncWrite> Conn<S> {
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: ConnReader {
                inner: BufReader::new(read),
                line: String::new(),
            },
            writer: ConnWriter { inner: write },
        }
    }

    /// Read the next message.
    pub async fn read(&mut self) -> Result<Message, ConnError> {
        self.reader.read().await
    }

    /// Write one message and flush it.
    pub async fn write(&mut self, message: &Message) -> Result<(), ConnError> {
        self.writer.write(message).await
    }

    /// Split into independently owned reader and writer halves.
    pub fn split(self) -> (ConnReader<S>, ConnWriter<S>) {
        (self.reader, self.writer)
    }
}

/// Reading half of a [`Conn`].
#[derive(Debug)]
pub struct ConnReader<S> {
    inner: BufReader<ReadHalf<S>>,
    line: String,
}

impl<S: AsyncRead + AsyncWrite> ConnReader<S> {
    /// Read one newline-terminated record and parse it.
    ///
    /// EOF before a complete record is [`ConnError::Closed`]; a malformed
    /// record is [`ConnError::Protocol`]. Neither is recoverable.
    pub async fn read(&mut self) -> Result<Message, ConnError> {
        self.line.clear();
        // Fresh limit per record; buffered bytes carry over between calls.
        let mut limited = (&mut self.inner).take(MAX_RECORD as u64 + 1);
        let n = limited.read_line(&mut self.line).await?;
        if n == 0 {
            return Err(ConnError::Closed);
        }
        if n > MAX_RECORD {
            return Err(ConnError::Oversize);
        }
        if !self.line.ends_with('\n') {
            return Err(ConnError::Closed);
        }
        Ok(self.line.trim_end().parse()?)
    }
}

/// Writing half of a [`Conn`].
#[derive(Debug)]
pub struct ConnWriter<S> {
    inner: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> ConnWriter<S> {
    pub async fn write(&mut self, message: &Message) -> Result<(), ConnError> {
        let mut line = message.to_string();
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
