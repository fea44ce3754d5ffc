//! Byte-level framing of messages onto a stream.
//!
//! Two interchangeable framings are provided, chosen when a connection is
//! constructed. [`Framing::Raw`] writes each message as a bare JSON object
//! and relies on JSON self-delimitation to find message boundaries.
//! [`Framing::Header`] wraps each message in the `Content-Length` header
//! form used by the Language Server Protocol.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::Error;
use crate::message::Message;

/// Largest Content-Length accepted by the header framing.
const MAX_CONTENT_LENGTH: i64 = i32::MAX as i64;

/// Reads one message at a time off a byte stream.
///
/// A reader is not safe for concurrent use; the connection engine drives
/// it from a single reader task.
#[async_trait]
pub trait MessageReader: Send {
    /// Read the next message, returning it with the number of bytes
    /// consumed. Any error is fatal to the connection.
    async fn read(&mut self) -> Result<(Message, u64), Error>;
}

/// Writes messages onto a byte stream.
///
/// Exclusive access (`&mut self`) keeps individual writes whole; the
/// connection engine additionally serializes writers behind its single
/// write token so frames from different tasks never interleave.
#[async_trait]
pub trait MessageWriter: Send {
    /// Write one message, returning the number of bytes written.
    async fn write(&mut self, message: &Message) -> Result<u64, Error>;

    /// Shut down the write side of the stream.
    async fn shutdown(&mut self) -> Result<(), Error>;
}

/// The framing mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Bare JSON objects, delimited by JSON syntax alone.
    Raw,
    /// `Content-Length` header framing (LSP compatible).
    #[default]
    Header,
}

impl Framing {
    /// Wrap a byte reader into a message reader.
    pub fn reader<R>(self, reader: R) -> Box<dyn MessageReader>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        match self {
            Framing::Raw => Box::new(RawReader {
                reader,
                buffer: BytesMut::with_capacity(4096),
            }),
            Framing::Header => Box::new(HeaderReader {
                reader: BufReader::new(reader),
            }),
        }
    }

    /// Wrap a byte writer into a message writer.
    pub fn writer<W>(self, writer: W) -> Box<dyn MessageWriter>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        match self {
            Framing::Raw => Box::new(RawWriter { writer }),
            Framing::Header => Box::new(HeaderWriter { writer }),
        }
    }
}

struct RawReader<R> {
    reader: R,
    buffer: BytesMut,
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> MessageReader for RawReader<R> {
    async fn read(&mut self) -> Result<(Message, u64), Error> {
        loop {
            // peel exactly one top-level JSON value off the buffer
            let peeled = {
                let mut values = serde_json::Deserializer::from_slice(&self.buffer)
                    .into_iter::<Box<RawValue>>();
                match values.next() {
                    Some(Ok(raw)) => Some(Ok((raw, values.byte_offset()))),
                    Some(Err(e)) if e.is_eof() => None,
                    Some(Err(e)) => Some(Err(Error::Parse(e.to_string()))),
                    None => None,
                }
            };
            match peeled {
                Some(Ok((raw, consumed))) => {
                    self.buffer.advance(consumed);
                    let message = Message::decode(raw.get().as_bytes())?;
                    return Ok((message, consumed as u64));
                }
                Some(Err(e)) => return Err(e),
                None => {}
            }

            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    Err(Error::Closed)
                } else {
                    Err(Error::Parse("unexpected end of stream".to_string()))
                };
            }
        }
    }
}

struct RawWriter<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> MessageWriter for RawWriter<W> {
    async fn write(&mut self, message: &Message) -> Result<u64, Error> {
        let data = message.encode()?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(data.len() as u64)
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct HeaderReader<R> {
    reader: BufReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> MessageReader for HeaderReader<R> {
    async fn read(&mut self) -> Result<(Message, u64), Error> {
        let mut total = 0u64;
        let mut length: Option<i64> = None;

        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                // clean close only between messages
                return if total == 0 {
                    Err(Error::Closed)
                } else {
                    Err(Error::Parse("unexpected end of stream in headers".to_string()))
                };
            }
            total += read as u64;

            let line = line.trim();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::Parse(format!("invalid header line {line:?}")));
            };
            if name == "Content-Length" {
                let value = value.trim();
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| Error::Parse(format!("failed parsing Content-Length: {value}")))?;
                if parsed <= 0 || parsed > MAX_CONTENT_LENGTH {
                    return Err(Error::Parse(format!("invalid Content-Length: {parsed}")));
                }
                length = Some(parsed);
            }
            // all other headers, Content-Type included, are ignored
        }

        let Some(length) = length else {
            return Err(Error::Parse("missing Content-Length header".to_string()));
        };
        let mut data = vec![0u8; length as usize];
        self.reader.read_exact(&mut data).await?;
        total += length as u64;

        let message = Message::decode(&data)?;
        Ok((message, total))
    }
}

struct HeaderWriter<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> MessageWriter for HeaderWriter<W> {
    async fn write(&mut self, message: &Message) -> Result<u64, Error> {
        let data = message.encode()?;
        let header = format!("Content-Length: {}\r\n\r\n", data.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok((header.len() + data.len()) as u64)
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
