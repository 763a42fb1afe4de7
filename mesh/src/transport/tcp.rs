use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use super::{
    addr::{normalize_ip, pick_private_ipv4, pick_unique_local_ipv6},
    conn::MeteredConn,
    tls::TlsContext,
    Connection, IncomingStream, Packet, Transport, TransportChannels, DIGEST_LEN,
    PACKET_CONNECTION, STREAM_CONNECTION,
};
use crate::{config::TcpTransportConfig, error::TransportError, metrics::TransportMetrics};

const PACKET_CHANNEL_SIZE: usize = 1024;
const STREAM_CHANNEL_SIZE: usize = 64;
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("packet digest mismatch")]
    DigestMismatch,
}

/// Builds a packet connection's bytes:
/// `[type][addr len][addr][payload][md5(payload)]`.
fn encode_packet(from: &str, payload: &[u8], digest: &[u8; DIGEST_LEN]) -> Result<Vec<u8>, TransportError> {
    let addr_len =
        u8::try_from(from.len()).map_err(|_| TransportError::AddressTooLong(from.to_string()))?;
    let mut frame = Vec::with_capacity(2 + from.len() + payload.len() + DIGEST_LEN);
    frame.push(PACKET_CONNECTION);
    frame.push(addr_len);
    frame.extend_from_slice(from.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(digest);
    Ok(frame)
}

fn packet_digest(payload: &[u8]) -> [u8; DIGEST_LEN] {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&Md5::digest(payload));
    digest
}

/// Splits `[payload][digest]` and verifies the digest.
fn verify_packet(body: &[u8]) -> Result<&[u8], PacketError> {
    if body.len() < DIGEST_LEN {
        return Err(PacketError::TooShort(body.len()));
    }
    let (payload, digest) = body.split_at(body.len() - DIGEST_LEN);
    if packet_digest(payload) != digest {
        return Err(PacketError::DigestMismatch);
    }
    Ok(payload)
}

struct OutboundPacket {
    addr: String,
    payload: Vec<u8>,
    digest: [u8; DIGEST_LEN],
}

struct Inner {
    cfg: TcpTransportConfig,
    tls: Option<TlsContext>,
    metrics: Arc<TransportMetrics>,
    /// Sender address written into outgoing packets.
    advertise: Mutex<Option<SocketAddr>>,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// TCP transport multiplexing packets and streams by a leading type byte.
pub struct TcpTransport {
    inner: Arc<Inner>,
    bound: Vec<SocketAddr>,
    write_tx: mpsc::Sender<OutboundPacket>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("bound", &self.bound)
            .field("tls", &self.inner.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Binds every configured address on one port and starts the accept
    /// loops and writer tasks.
    pub async fn bind(
        cfg: TcpTransportConfig,
    ) -> Result<(Arc<Self>, TransportChannels), TransportError> {
        Self::bind_with_metrics(cfg, Arc::new(TransportMetrics::new())).await
    }

    pub async fn bind_with_metrics(
        cfg: TcpTransportConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Result<(Arc<Self>, TransportChannels), TransportError> {
        if cfg.bind_addrs.is_empty() {
            return Err(TransportError::NoBindAddress);
        }
        let tls = TlsContext::from_config(&cfg.tls)?;

        let mut port = cfg.bind_port;
        let mut listeners = Vec::with_capacity(cfg.bind_addrs.len());
        for addr in &cfg.bind_addrs {
            let ip: IpAddr = addr.parse().map_err(|_| TransportError::Bind {
                addr: addr.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid IP address"),
            })?;
            let sock = SocketAddr::new(ip, port);
            let listener = TcpListener::bind(sock)
                .await
                .map_err(|source| TransportError::Bind {
                    addr: sock.to_string(),
                    source,
                })?;
            if port == 0 {
                port = listener.local_addr()?.port();
            }
            listeners.push(listener);
        }
        let bound = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<io::Result<Vec<_>>>()?;

        let (shutdown_tx, _) = watch::channel(false);
        let advertise = bound.first().filter(|a| !a.ip().is_unspecified()).copied();
        let inner = Arc::new(Inner {
            cfg,
            tls,
            metrics,
            advertise: Mutex::new(advertise),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        });

        let (packets_tx, packets) = mpsc::channel(PACKET_CHANNEL_SIZE);
        let (streams_tx, streams) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let (write_tx, write_rx) = mpsc::channel(inner.cfg.max_concurrent_writes);

        let mut tasks = Vec::new();
        for listener in listeners {
            tasks.push(tokio::spawn(accept_loop(
                inner.clone(),
                listener,
                packets_tx.clone(),
                streams_tx.clone(),
            )));
        }
        let write_rx = Arc::new(tokio::sync::Mutex::new(write_rx));
        for _ in 0..inner.cfg.max_concurrent_writes {
            tasks.push(tokio::spawn(write_worker(inner.clone(), write_rx.clone())));
        }

        info!(addrs = ?bound, tls = inner.tls.is_some(), "TCP transport listening");

        let transport = Arc::new(Self {
            inner,
            bound,
            write_tx,
            tasks: Mutex::new(tasks),
        });
        Ok((transport, TransportChannels { packets, streams }))
    }

    pub fn bound_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Port every listener is bound to.
    pub fn bound_port(&self) -> u16 {
        self.bound.first().map(|a| a.port()).unwrap_or(0)
    }

    pub fn metrics(&self) -> Arc<TransportMetrics> {
        self.inner.metrics.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn resolve_advertise_addr(
        &self,
        ip: Option<&str>,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        let port = if port == 0 { self.bound_port() } else { port };
        if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
            let parsed: IpAddr = ip
                .parse()
                .map_err(|_| TransportError::InvalidAdvertiseAddr(ip.to_string()))?;
            return Ok(SocketAddr::new(normalize_ip(parsed), port));
        }

        let first = self.bound.first().ok_or(TransportError::NoBindAddress)?;
        let ip = match first.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => {
                IpAddr::V4(pick_private_ipv4().ok_or(TransportError::NoPrivateAddress)?)
            }
            IpAddr::V6(v6) if v6.is_unspecified() => {
                IpAddr::V6(pick_unique_local_ipv6().ok_or(TransportError::NoPrivateAddress)?)
            }
            bound => normalize_ip(bound),
        };
        Ok(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn final_advertise_addr(
        &self,
        ip: Option<&str>,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        let addr = self.resolve_advertise_addr(ip, port)?;
        *self.inner.advertise.lock() = Some(addr);
        Ok(addr)
    }

    async fn write_to(&self, buf: &[u8], addr: &str) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }
        let limit = self.inner.cfg.max_packet_size;
        if buf.len() > limit {
            return Err(TransportError::PacketTooLarge {
                size: buf.len(),
                limit,
            });
        }
        let packet = OutboundPacket {
            addr: addr.to_string(),
            payload: buf.to_vec(),
            digest: packet_digest(buf),
        };
        match timeout(
            self.inner.cfg.acquire_writer_timeout,
            self.write_tx.send(packet),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ShuttingDown),
            Err(_) => {
                self.inner.metrics.packets_dropped(1);
                debug!(addr, "No packet writer available in time, dropping packet");
                Ok(())
            }
        }
    }

    async fn dial_timeout(
        &self,
        addr: &str,
        dial_timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }
        let inner = &self.inner;
        let mut conn = timeout(dial_timeout, async {
            let stream = TcpStream::connect(addr).await?;
            inner.wrap_outbound(stream).await
        })
        .await
        .map_err(|_| TransportError::DialTimeout(addr.to_string()))??;

        conn.write_all(&[STREAM_CONNECTION]).await?;
        conn.flush().await?;
        inner.metrics.streams_dialed(1);
        if inner.cfg.transport_debug {
            debug!(addr, "Stream connection opened");
        }
        Ok(conn)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Transport task failed during shutdown");
            }
        }
        info!(addrs = ?self.bound, "TCP transport stopped");
        Ok(())
    }
}

impl Inner {
    async fn wrap_outbound(&self, stream: TcpStream) -> Result<Box<dyn Connection>, TransportError> {
        stream.set_nodelay(true)?;
        Ok(match &self.tls {
            Some(tls) => Box::new(MeteredConn::new(
                tls.connect(stream).await?,
                self.metrics.clone(),
            )),
            None => Box::new(MeteredConn::new(stream, self.metrics.clone())),
        })
    }

    async fn wrap_inbound(&self, stream: TcpStream) -> Result<Box<dyn Connection>, TransportError> {
        stream.set_nodelay(true)?;
        Ok(match &self.tls {
            Some(tls) => Box::new(MeteredConn::new(
                tls.accept(stream).await?,
                self.metrics.clone(),
            )),
            None => Box::new(MeteredConn::new(stream, self.metrics.clone())),
        })
    }

    async fn send_packet(&self, packet: &OutboundPacket) -> Result<(), TransportError> {
        let advertised = *self.advertise.lock();
        let (mut conn, from) = timeout(self.cfg.packet_dial_timeout, async {
            let stream = TcpStream::connect(&packet.addr).await?;
            let from = match advertised {
                Some(addr) => addr.to_string(),
                None => stream.local_addr()?.to_string(),
            };
            Ok::<_, TransportError>((self.wrap_outbound(stream).await?, from))
        })
        .await
        .map_err(|_| TransportError::DialTimeout(packet.addr.clone()))??;

        let frame = encode_packet(&from, &packet.payload, &packet.digest)?;
        timeout(self.cfg.packet_write_timeout, async {
            conn.write_all(&frame).await?;
            conn.shutdown().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "packet write timed out"))??;
        Ok(())
    }

    /// Reads `[addr len][addr][payload][digest]` until EOF. Bodies longer
    /// than `max_packet_size` plus the digest are rejected.
    async fn read_packet(&self, conn: &mut Box<dyn Connection>) -> Result<Packet, TransportError> {
        let timestamp = Instant::now();
        let mut len = [0u8; 1];
        conn.read_exact(&mut len).await?;
        let mut from = vec![0u8; len[0] as usize];
        conn.read_exact(&mut from).await?;
        let from = String::from_utf8_lossy(&from).into_owned();

        let max_body = self.cfg.max_packet_size + DIGEST_LEN;
        let mut body = Vec::new();
        (&mut **conn)
            .take(max_body as u64 + 1)
            .read_to_end(&mut body)
            .await?;
        if body.len() > max_body {
            self.metrics.packets_invalid(1);
            warn!(from = %from, limit = self.cfg.max_packet_size, "Dropping oversized packet");
            return Err(TransportError::PacketTooLarge {
                size: body.len() - DIGEST_LEN,
                limit: self.cfg.max_packet_size,
            });
        }
        let payload = match verify_packet(&body) {
            Ok(payload) => payload,
            Err(e) => {
                match e {
                    PacketError::TooShort(_) => self.metrics.packets_invalid(1),
                    PacketError::DigestMismatch => self.metrics.packet_digest_mismatches(1),
                }
                warn!(from = %from, error = %e, "Dropping packet");
                return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()).into());
            }
        };
        Ok(Packet {
            buf: payload.to_vec(),
            from,
            timestamp,
        })
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        packets_tx: mpsc::Sender<Packet>,
        streams_tx: mpsc::Sender<IncomingStream>,
    ) {
        let read_timeout = self.cfg.packet_write_timeout;
        let handshake = timeout(read_timeout, async {
            let mut conn = self.wrap_inbound(stream).await?;
            let mut kind = [0u8; 1];
            conn.read_exact(&mut kind).await?;
            Ok::<_, TransportError>((conn, kind[0]))
        })
        .await;
        let (mut conn, kind) = match handshake {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(%remote, error = %e, "Failed to read connection type");
                return;
            }
            Err(_) => {
                debug!(%remote, "Timed out reading connection type");
                return;
            }
        };

        match kind {
            PACKET_CONNECTION => {
                let packet = match timeout(read_timeout, self.read_packet(&mut conn)).await {
                    Ok(Ok(packet)) => packet,
                    Ok(Err(e)) => {
                        debug!(%remote, error = %e, "Failed to read packet");
                        return;
                    }
                    Err(_) => {
                        self.metrics.packets_invalid(1);
                        debug!(%remote, "Timed out reading packet");
                        return;
                    }
                };
                self.metrics.packets_received(1);
                self.metrics.packets_received_bytes(packet.buf.len() as u64);
                if self.cfg.transport_debug {
                    debug!(%remote, from = %packet.from, size = packet.buf.len(), "Packet received");
                }
                let _ = packets_tx.send(packet).await;
            }
            STREAM_CONNECTION => {
                self.metrics.streams_received(1);
                if self.cfg.transport_debug {
                    debug!(%remote, "Stream connection accepted");
                }
                let _ = streams_tx.send(IncomingStream { conn, remote }).await;
            }
            other => {
                self.metrics.unknown_connections(1);
                warn!(%remote, kind = other, "{}", TransportError::UnknownConnectionType(other));
            }
        }
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    packets_tx: mpsc::Sender<Packet>,
    streams_tx: mpsc::Sender<IncomingStream>,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut backoff = Duration::ZERO;

    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        tokio::select! {
            _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    backoff = Duration::ZERO;
                    tokio::spawn(inner.clone().handle_connection(
                        stream,
                        remote,
                        packets_tx.clone(),
                        streams_tx.clone(),
                    ));
                }
                Err(e) => {
                    if inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    inner.metrics.accept_errors(1);
                    backoff = if backoff.is_zero() {
                        MIN_ACCEPT_BACKOFF
                    } else {
                        (backoff * 2).min(MAX_ACCEPT_BACKOFF)
                    };
                    warn!(error = %e, ?backoff, "Error accepting TCP connection");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    debug!("TCP accept loop stopped");
}

async fn write_worker(
    inner: Arc<Inner>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundPacket>>>,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        // queued packets are still sent after shutdown starts
        let packet = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                packet = rx.recv() => packet,
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => None,
            }
        };
        let Some(packet) = packet else { break };

        match inner.send_packet(&packet).await {
            Ok(()) => {
                inner.metrics.packets_sent(1);
                inner.metrics.packets_sent_bytes(packet.payload.len() as u64);
                if inner.cfg.transport_debug {
                    debug!(addr = %packet.addr, size = packet.payload.len(), "Packet sent");
                }
            }
            Err(e) => {
                inner.metrics.packet_write_errors(1);
                warn!(addr = %packet.addr, error = %e, "Failed to send packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TlsConfig, tests::test_utils::init_test_logging};

    fn loopback_config() -> TcpTransportConfig {
        TcpTransportConfig {
            bind_addrs: vec!["127.0.0.1".to_string()],
            bind_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_packet_frame_layout() {
        let digest = packet_digest(b"payload");
        let frame = encode_packet("10.0.0.1:7946", b"payload", &digest).unwrap();
        assert_eq!(frame[0], PACKET_CONNECTION);
        assert_eq!(frame[1] as usize, "10.0.0.1:7946".len());
        assert_eq!(verify_packet(&frame[2 + 13..]).unwrap(), b"payload");

        let long = "x".repeat(300);
        assert!(matches!(
            encode_packet(&long, b"", &digest),
            Err(TransportError::AddressTooLong(_))
        ));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut body = b"payload".to_vec();
        body.extend_from_slice(&packet_digest(b"payload"));
        body[0] ^= 0xff;
        assert_eq!(verify_packet(&body), Err(PacketError::DigestMismatch));
        assert_eq!(verify_packet(&[0; 4]), Err(PacketError::TooShort(4)));
    }

    #[tokio::test]
    async fn test_packet_delivered_between_transports() {
        init_test_logging();
        let (a, _a_channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let (b, mut b_channels) = TcpTransport::bind(loopback_config()).await.unwrap();

        let b_addr = b.bound_addrs()[0].to_string();
        a.write_to(b"hello", &b_addr).await.unwrap();

        let packet = timeout(Duration::from_secs(5), b_channels.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.buf, b"hello");
        // the sender's listening address, not the ephemeral dial port
        assert_eq!(packet.from, a.bound_addrs()[0].to_string());
        assert_eq!(b.metrics().snapshot().packets_received, 1);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_packet_dropped_on_receive() {
        let (b, mut b_channels) = TcpTransport::bind(loopback_config()).await.unwrap();

        let mut frame = encode_packet("127.0.0.1:1", b"hello", &packet_digest(b"hello")).unwrap();
        let payload_at = frame.len() - DIGEST_LEN - 1;
        frame[payload_at] ^= 0x01;
        let mut raw = TcpStream::connect(b.bound_addrs()[0]).await.unwrap();
        raw.write_all(&frame).await.unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        let got = timeout(Duration::from_millis(300), b_channels.packets.recv()).await;
        assert!(got.is_err());
        assert_eq!(b.metrics().snapshot().packet_digest_mismatches, 1);
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_handed_to_receiver() {
        let (a, _a_channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let (b, mut b_channels) = TcpTransport::bind(loopback_config()).await.unwrap();

        let mut conn = a
            .dial_timeout(&b.bound_addrs()[0].to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut incoming = timeout(Duration::from_secs(5), b_channels.streams.recv())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 4];
        incoming.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_connection_type_counted() {
        let (b, _channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let mut raw = TcpStream::connect(b.bound_addrs()[0]).await.unwrap();
        raw.write_all(&[7]).await.unwrap();
        drop(raw);

        let metrics = b.metrics();
        let ok = crate::tests::test_utils::wait_for(Duration::from_secs(2), || {
            metrics.snapshot().unknown_connections == 1
        })
        .await;
        assert!(ok);
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertise_addr_resolution() {
        let (t, _channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let port = t.bound_port();

        let explicit = t.final_advertise_addr(Some("::ffff:10.1.2.3"), 9000).unwrap();
        assert_eq!(explicit, "10.1.2.3:9000".parse().unwrap());

        let derived = t.final_advertise_addr(None, 0).unwrap();
        assert_eq!(derived, SocketAddr::from(([127, 0, 0, 1], port)));
        let overridden = t.final_advertise_addr(None, 9000).unwrap();
        assert_eq!(overridden, SocketAddr::from(([127, 0, 0, 1], 9000)));

        assert!(matches!(
            t.final_advertise_addr(Some("not-an-ip"), 1),
            Err(TransportError::InvalidAdvertiseAddr(_))
        ));
        t.shutdown().await.unwrap();
        assert!(matches!(
            t.write_to(b"x", "127.0.0.1:1").await,
            Err(TransportError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let cfg = TcpTransportConfig {
            bind_addrs: vec!["not-an-ip".to_string()],
            ..loopback_config()
        };
        assert!(matches!(
            TcpTransport::bind(cfg).await,
            Err(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_packet_sender_is_advertised_addr() {
        let (a, _a_channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let (b, mut b_channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let advertised = a.final_advertise_addr(Some("127.0.0.1"), 9000).unwrap();

        a.write_to(b"hi", &b.bound_addrs()[0].to_string())
            .await
            .unwrap();
        let packet = timeout(Duration::from_secs(5), b_channels.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.from, advertised.to_string());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_packets_rejected() {
        let cfg = TcpTransportConfig {
            max_packet_size: 8,
            ..loopback_config()
        };
        let (b, mut b_channels) = TcpTransport::bind(cfg).await.unwrap();

        assert!(matches!(
            b.write_to(&[0u8; 9], "127.0.0.1:1").await,
            Err(TransportError::PacketTooLarge { size: 9, limit: 8 })
        ));

        let payload = [7u8; 64];
        let frame = encode_packet("127.0.0.1:1", &payload, &packet_digest(&payload)).unwrap();
        let mut raw = TcpStream::connect(b.bound_addrs()[0]).await.unwrap();
        raw.write_all(&frame).await.unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        let got = timeout(Duration::from_millis(300), b_channels.packets.recv()).await;
        assert!(got.is_err());
        assert_eq!(b.metrics().snapshot().packets_invalid, 1);
        b.shutdown().await.unwrap();
    }

    /// Loopback config sharing one self-signed certificate, so every
    /// transport built from it trusts the others.
    fn tls_loopback_config(tag: &str) -> (TcpTransportConfig, std::path::PathBuf) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("kv-mesh-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let cfg = TcpTransportConfig {
            tls: TlsConfig {
                enabled: true,
                cert_path: Some(cert_path.to_string_lossy().into_owned()),
                key_path: Some(key_path.to_string_lossy().into_owned()),
                ..Default::default()
            },
            ..loopback_config()
        };
        (cfg, dir)
    }

    #[tokio::test]
    async fn test_tls_packet_and_stream_round_trip() {
        init_test_logging();
        let (cfg, dir) = tls_loopback_config("tls-roundtrip");
        let (a, _a_channels) = TcpTransport::bind(cfg.clone()).await.unwrap();
        let (b, mut b_channels) = TcpTransport::bind(cfg).await.unwrap();
        let b_addr = b.bound_addrs()[0].to_string();

        a.write_to(b"over tls", &b_addr).await.unwrap();
        let packet = timeout(Duration::from_secs(5), b_channels.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.buf, b"over tls");
        assert_eq!(packet.from, a.bound_addrs()[0].to_string());

        let mut conn = a
            .dial_timeout(&b_addr, Duration::from_secs(2))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut incoming = timeout(Duration::from_secs(5), b_channels.streams.recv())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 4];
        incoming.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        incoming.conn.write_all(b"pong").await.unwrap();
        incoming.conn.flush().await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_plaintext_packet_rejected_by_tls_listener() {
        let (cfg, dir) = tls_loopback_config("tls-plain");
        let (plain, _plain_channels) = TcpTransport::bind(loopback_config()).await.unwrap();
        let (secure, mut secure_channels) = TcpTransport::bind(cfg).await.unwrap();

        plain
            .write_to(b"hello", &secure.bound_addrs()[0].to_string())
            .await
            .unwrap();
        let got = timeout(Duration::from_millis(500), secure_channels.packets.recv()).await;
        assert!(got.is_err());
        assert_eq!(secure.metrics().snapshot().packets_received, 0);

        plain.shutdown().await.unwrap();
        secure.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
