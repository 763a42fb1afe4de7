//! Point-to-point transport used by the membership engine.
//!
//! Every TCP connection starts with one type byte. A `packet` connection
//! carries exactly one datagram-like message and is closed by the sender; a
//! `stream` connection is handed to the engine for request/response
//! exchanges such as push/pull and probes.

mod addr;
mod conn;
mod tcp;
mod tls;

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};

pub use addr::{normalize_ip, pick_private_ipv4, pick_unique_local_ipv6};
pub use conn::MeteredConn;
pub use tcp::TcpTransport;

use crate::error::TransportError;

pub const PACKET_CONNECTION: u8 = 1;
pub const STREAM_CONNECTION: u8 = 2;

/// Size of the MD5 digest trailing every packet.
pub const DIGEST_LEN: usize = 16;

pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Vec<u8>,
    /// Advertised address of the sender, taken from the packet header.
    pub from: String,
    pub timestamp: Instant,
}

pub struct IncomingStream {
    pub conn: Box<dyn Connection>,
    pub remote: SocketAddr,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Receiving ends of the inbound packet and stream channels.
#[derive(Debug)]
pub struct TransportChannels {
    pub packets: tokio::sync::mpsc::Receiver<Packet>,
    pub streams: tokio::sync::mpsc::Receiver<IncomingStream>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address and port to advertise to peers. An explicit `ip` wins,
    /// otherwise one is derived from the bound listeners. Port 0 means the
    /// bound port. Outgoing packets carry the returned address as sender.
    fn final_advertise_addr(
        &self,
        ip: Option<&str>,
        port: u16,
    ) -> Result<SocketAddr, TransportError>;

    /// Sends one packet. Delivery is best effort: a packet that cannot be
    /// handed to a writer in time is dropped and still reported as sent.
    async fn write_to(&self, buf: &[u8], addr: &str) -> Result<(), TransportError>;

    /// Opens a stream connection.
    async fn dial_timeout(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError>;

    async fn shutdown(&self) -> Result<(), TransportError>;
}
