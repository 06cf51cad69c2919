//! The message channel: a bidirectional, length-prefixed framed transport
//! of structured records over one TCP connection.
//!
//! Mirrors the buffered read/parse loop of a RESP connection, but frames a
//! JSON payload behind a 4-byte big-endian length prefix instead of parsing
//! a byte-level wire grammar, since this system has no external wire
//! contract to be compatible with.

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
const LEN_PREFIX_SIZE: usize = 4;

/// Trait bound satisfied by any stream a [`MessageChannel`] can wrap.
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

/// Send and receive structured records from a remote peer.
///
/// `recv` returns `Ok(None)` when the peer has closed the connection
/// cleanly between records; any other close is an I/O error.
#[derive(Debug)]
pub struct MessageChannel<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    peer_addr: Option<SocketAddr>,
}

impl MessageChannel<TcpStream> {
    /// Wrap an accepted `TcpStream`, recording its observed peer address.
    pub fn from_tcp(socket: TcpStream) -> Self {
        let peer_addr = socket.peer_addr().ok();
        Self {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            peer_addr,
        }
    }

    /// The peer address observed at accept time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl<S: ChannelStream> MessageChannel<S> {
    #[cfg(test)]
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            peer_addr: None,
        }
    }

    /// Read the next record from the connection, waiting until a full frame
    /// has been buffered.
    ///
    /// Returns `Ok(None)` on a clean peer close between frames.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(record) = self.try_parse()? {
                return Ok(Some(record));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    debug!("peer closed connection cleanly");
                    return Ok(None);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection closed mid frame",
                )));
            }
        }
    }

    fn try_parse<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buffer.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buffer[..LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
        if self.buffer.len() < LEN_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(LEN_PREFIX_SIZE);
        let payload = self.buffer.split_to(len);
        let record = serde_json::from_slice(&payload)?;
        Ok(Some(record))
    }

    /// Frame and write one record to the underlying stream.
    pub async fn send<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| Error::Framing("record too large to frame".into()))?;

        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Reply};

    #[tokio::test]
    async fn round_trips_a_command_through_the_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client_chan = MessageChannel::new(client);
        let mut server_chan = MessageChannel::new(server);

        let cmd = Command::GetLogin {
            name: "worker-1".into(),
            processid: 4242,
        };
        client_chan.send(&cmd).await.unwrap();
        let received: Command = server_chan.recv().await.unwrap().unwrap();
        assert_eq!(cmd, received);

        let reply = Reply::GiveLogin { clientid: 1 };
        server_chan.send(&reply).await.unwrap();
        let received: Reply = client_chan.recv().await.unwrap().unwrap();
        assert_eq!(reply, received);
    }

    #[tokio::test]
    async fn recv_returns_none_on_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server_chan = MessageChannel::new(server);
        let received: Option<Command> = server_chan.recv().await.unwrap();
        assert!(received.is_none());
    }
}
