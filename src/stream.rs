//! Socket-stream facade: fixed-size read/write loops over an owned [`TcpStream`].
//!
//! Grounded on the donor's connection I/O pattern (`server::connection::HttpConnection`
//! fills a buffer in a loop until the parser is satisfied) and on
//! `flux-network`'s `tcp::stream` module, which wraps a raw socket with explicit
//! read/write state rather than leaning on `AsyncReadExt`/`AsyncWriteExt` alone. This
//! type is the socket-facing counterpart used by the client pool (`crate::client`) and
//! the WebSocket codec (`crate::ws`), both of which need "read exactly N bytes" and
//! "write exactly N bytes" framing primitives rather than arbitrary-length reads.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::errors::Error;

/// An owned TCP connection plus the peer/local addresses captured at accept/connect
/// time (avoids a syscall to re-fetch them later, e.g. for access logging).
#[derive(Debug)]
pub struct SocketStream {
    inner: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl SocketStream {
    pub fn new(inner: TcpStream, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            inner,
            peer_addr,
            local_addr,
        }
    }

    /// Wraps an already-connected stream, querying its addresses.
    pub fn from_connected(inner: TcpStream) -> Result<Self, Error> {
        let peer_addr = inner.peer_addr().map_err(Error::Io)?;
        let local_addr = inner.local_addr().map_err(Error::Io)?;
        Ok(Self::new(inner, peer_addr, local_addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Disables Nagle's algorithm; the donor server does this on every accepted
    /// connection so small HTTP/Rock frames aren't delayed.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<(), Error> {
        self.inner.set_nodelay(nodelay).map_err(Error::Io)
    }

    /// Reads until `buf` is completely filled or the stream reaches EOF early.
    pub async fn read_fix_size(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_exact(buf).await.map_err(Error::Io)?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes without requiring the buffer to be filled,
    /// returning the number of bytes actually read (0 means the peer closed).
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.inner.read(buf).await.map_err(Error::Io)
    }

    /// Writes the whole of `buf`, looping internally until every byte is accepted.
    pub async fn write_fix_size(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf).await.map_err(Error::Io)?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await.map_err(Error::Io)
    }

    /// Half-closes the write side; used by the client pool before dropping a
    /// connection it intends to retire rather than reuse.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await.map_err(Error::Io)
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn read_fix_size_fills_the_whole_buffer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut server_stream = SocketStream::from_connected(server).unwrap();
        let mut client_stream = SocketStream::from_connected(client).unwrap();

        client_stream.write_fix_size(b"0123456789").await.unwrap();

        let mut buf = [0u8; 10];
        server_stream.read_fix_size(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[tokio::test]
    async fn read_fix_size_errors_on_early_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut server_stream = SocketStream::from_connected(server).unwrap();
        drop(client);

        let mut buf = [0u8; 10];
        assert!(server_stream.read_fix_size(&mut buf).await.is_err());
    }
}
