// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `ClientSocket`: a uniform view over a TCP stream and a single UDP
//! datagram, so the session state machine (§4.D) never has to care which
//! transport it is driving (§9, "Datagram vs stream uniformity").

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// A transport-agnostic socket as consumed by [`crate::codec::FrameReader`]
/// and the session driver.
pub trait ClientSocket: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of input: FIN for
    /// TCP, datagram exhausted for UDP.
    fn read(&mut self, buf: &mut [u8]) -> impl std::future::Future<Output = io::Result<usize>> + Send;

    fn write_all(&mut self, buf: &[u8]) -> impl std::future::Future<Output = io::Result<()>> + Send;

    fn peer_addr(&self) -> SocketAddr;

    fn is_tcp(&self) -> bool;

    /// Set a linger period and close the transport. Consumes `self`: there
    /// is no reuse of a closed socket.
    fn close(self, linger: Duration) -> impl std::future::Future<Output = ()> + Send;
}

pub struct TcpClientSocket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpClientSocket {
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        TcpClientSocket { stream, peer }
    }
}

impl ClientSocket for TcpClientSocket {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_tcp(&self) -> bool {
        true
    }

    async fn close(mut self, linger: Duration) {
        let _ = self.stream.flush().await;
        if let Ok(std_stream) = self.stream.into_std() {
            let _ = std_stream.set_linger(Some(linger));
            // Dropping `std_stream` here actually closes the descriptor with
            // the linger option applied.
        }
    }
}

/// A single UDP datagram, presented as a byte-cursor `ClientSocket` that
/// reports `Ok(0)` once exhausted (§4.F).
pub struct UdpClientSocket {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    datagram: Vec<u8>,
    pos: usize,
}

impl UdpClientSocket {
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, datagram: Vec<u8>) -> Self {
        UdpClientSocket {
            socket,
            peer,
            datagram,
            pos: 0,
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.datagram.len() - self.pos
    }
}

impl ClientSocket for UdpClientSocket {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.available().min(buf.len());
        buf[..n].copy_from_slice(&self.datagram[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.socket.send_to(buf, self.peer).await.map(|_| ())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_tcp(&self) -> bool {
        false
    }

    async fn close(self, _linger: Duration) {
        // Datagrams carry no connection state to linger on.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_socket_reports_eos_once_exhausted() {
        let bound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut sock = UdpClientSocket::new(Arc::new(bound), peer, vec![1, 2, 3]);

        let mut buf = [0u8; 8];
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
