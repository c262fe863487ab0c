//! Inbound protocol streams and length-delimited message framing

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures::{SinkExt, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::connection::Substream;
use crate::{NetworkError, Result};

/// Stream opened by a remote peer for an accepted protocol
#[derive(Debug)]
pub struct InboundStream {
    pub peer: PeerId,
    pub stream: Substream,
}

/// Inbound streams for one protocol. Dropping it stops accepting the
/// protocol.
pub struct IncomingStreams {
    protocol: StreamProtocol,
    rx: mpsc::Receiver<InboundStream>,
}

impl IncomingStreams {
    pub(crate) fn new(protocol: StreamProtocol, rx: mpsc::Receiver<InboundStream>) -> Self {
        Self { protocol, rx }
    }

    pub async fn next(&mut self) -> Option<InboundStream> {
        self.rx.recv().await
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }
}

/// Bincode messages over a `u32` big-endian length-delimited stream
///
/// The codec reads ahead. [`MessageStream::into_inner`] hands back whatever
/// it buffered past the last message, so a stream can switch from messages
/// to raw bytes without losing data.
pub struct MessageStream<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    max_size: usize,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, max_size: usize) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .length_field_type::<u32>()
            .max_frame_length(max_size)
            .new_framed(io);
        Self { framed, max_size }
    }

    /// Limit for messages sent or received from now on
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.framed.codec_mut().set_max_frame_length(max_size);
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = bincode::serialize(message)?;
        if bytes.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge { limit: self.max_size });
        }
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Next message. EOF before a frame starts is [`NetworkError::ConnectionClosed`].
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(bincode::deserialize(&frame)?),
            Some(Err(e)) if is_oversize(&e) => Err(NetworkError::MessageTooLarge { limit: self.max_size }),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn get_ref(&self) -> &S {
        self.framed.get_ref()
    }

    /// The underlying stream, replaying bytes read past the last message
    pub fn into_inner(self) -> Rewind<S> {
        let parts = self.framed.into_parts();
        Rewind::new(parts.io, parts.read_buf.freeze())
    }
}

fn is_oversize(e: &std::io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}

/// A stream that yields `prefix` before reading from `inner`
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Bytes not yet replayed
    pub fn buffered(&self) -> usize {
        self.prefix.len()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    fn ping(seq: u32) -> Ping {
        Ping {
            seq,
            note: "hi".to_string(),
        }
    }

    #[tokio::test]
    async fn test_message_framing() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = MessageStream::new(a, 1024);
        let mut b = MessageStream::new(b, 1024);

        a.send(&ping(3)).await.unwrap();
        a.send(&ping(4)).await.unwrap();
        assert_eq!(b.recv::<Ping>().await.unwrap(), ping(3));
        assert_eq!(b.recv::<Ping>().await.unwrap(), ping(4));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = MessageStream::new(a, 16);
        let big = Ping {
            seq: 1,
            note: "x".repeat(100),
        };
        assert!(matches!(
            a.send(&big).await,
            Err(NetworkError::MessageTooLarge { limit: 16 })
        ));

        let mut a = a.into_inner();
        a.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
        let mut reader = MessageStream::new(b, 1024);
        let result: Result<Ping> = reader.recv().await;
        assert!(matches!(result, Err(NetworkError::MessageTooLarge { limit: 1024 })));
    }

    #[tokio::test]
    async fn test_raised_limit_applies_to_next_message() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = MessageStream::new(a, 4096);
        let mut b = MessageStream::new(b, 16);
        let big = Ping {
            seq: 1,
            note: "x".repeat(100),
        };
        a.send(&big).await.unwrap();
        b.set_max_size(4096);
        assert_eq!(b.recv::<Ping>().await.unwrap(), big);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut b = MessageStream::new(b, 1024);
        let result: Result<Ping> = b.recv().await;
        assert!(matches!(result, Err(NetworkError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_bytes_after_last_message_survive() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = MessageStream::new(a, 1024);
        a.send(&ping(7)).await.unwrap();
        let mut a = a.into_inner();
        a.write_all(b"raw tail").await.unwrap();
        drop(a);

        let mut b = MessageStream::new(b, 1024);
        // The whole duplex buffer is in the codec by now
        assert_eq!(b.recv::<Ping>().await.unwrap(), ping(7));

        let mut rest = b.into_inner();
        let mut tail = Vec::new();
        rest.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"raw tail");
    }

    #[tokio::test]
    async fn test_rewind_replays_prefix_first() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(b"world").await.unwrap();
        drop(a);

        let mut rewind = Rewind::new(b, Bytes::from_static(b"hello "));
        assert_eq!(rewind.buffered(), 6);
        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }
}
