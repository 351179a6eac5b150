// Link to a Scrutiny server over TCP or UDP.
//
// A link is a pair of background tasks around a framed socket: the writer
// drains an unbounded queue into the sink, the reader forwards decoded
// datagrams to a bounded channel. Closing the link cancels both.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;

use crate::error::Error;
use crate::framing::{DatagramCodec, FramingConfig, MAX_HEADER_LENGTH, TAG_SIZE};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Largest UDP payload over IPv4.
const UDP_MAX_DATAGRAM: usize = 65_507;

// ── TransportConfig ──────────────────────────────────────────────────

/// Socket kind used to reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkKind {
    #[default]
    Tcp,
    Udp,
}

/// Options for opening a [`Link`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: LinkKind,
    pub connect_timeout: Duration,
    pub framing: FramingConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Tcp,
            connect_timeout: Duration::from_secs(5),
            framing: FramingConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Framing options with the MTU clamped to what the socket kind can carry.
    fn effective_framing(&self) -> FramingConfig {
        let mut framing = self.framing.clone();
        if self.kind == LinkKind::Udp {
            framing.mtu = framing.mtu.min(UDP_MAX_DATAGRAM - MAX_HEADER_LENGTH - TAG_SIZE);
        }
        framing
    }
}

// ── Counters ─────────────────────────────────────────────────────────

/// Byte and datagram totals for one link, payload sizes only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_datagrams: u64,
    pub tx_datagrams: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_datagrams: AtomicU64,
    tx_datagrams: AtomicU64,
}

impl Counters {
    fn record_rx(&self, len: usize) {
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.rx_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tx(&self, len: usize) {
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.tx_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkCounters {
        LinkCounters {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_datagrams: self.rx_datagrams.load(Ordering::Relaxed),
            tx_datagrams: self.tx_datagrams.load(Ordering::Relaxed),
        }
    }
}

// ── Link ─────────────────────────────────────────────────────────────

/// An open link. Split it to hand the receive side to a listener task.
#[derive(Debug)]
pub struct Link {
    sender: LinkSender,
    receiver: LinkReceiver,
}

/// Cloneable send side of a [`Link`].
#[derive(Debug, Clone)]
pub struct LinkSender {
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    peer: SocketAddr,
}

/// Receive side of a [`Link`].
#[derive(Debug)]
pub struct LinkReceiver {
    inbound: mpsc::Receiver<Result<Bytes, Error>>,
    cancel: CancellationToken,
}

impl Link {
    /// Resolve `addr` (`host:port`) and open a link of the configured kind.
    pub async fn open(addr: &str, config: &TransportConfig) -> Result<Self, Error> {
        let timeout = config.connect_timeout;
        let fut = Self::open_inner(addr, config);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                addr: addr.to_owned(),
                timeout,
            }),
        }
    }

    async fn open_inner(addr: &str, config: &TransportConfig) -> Result<Self, Error> {
        let connect_err = |source: std::io::Error| Error::Connect {
            addr: addr.to_owned(),
            source,
        };
        let peer = tokio::net::lookup_host(addr)
            .await
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address resolved to nothing",
                ))
            })?;

        let codec = DatagramCodec::new(config.effective_framing());
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        match config.kind {
            LinkKind::Tcp => {
                let stream = TcpStream::connect(peer).await.map_err(connect_err)?;
                stream.set_nodelay(true).map_err(connect_err)?;
                let (sink, stream) = Framed::new(stream, codec).split::<Bytes>();
                tokio::spawn(write_loop(sink, out_rx, cancel.clone(), counters.clone(), |b| b));
                tokio::spawn(read_loop(
                    stream.map(move |r| r.map(move |b| (b, peer))),
                    peer,
                    in_tx,
                    cancel.clone(),
                    counters.clone(),
                ));
            }
            LinkKind::Udp => {
                let local = if peer.is_ipv4() {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                } else {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
                };
                let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
                let (sink, stream) = UdpFramed::new(socket, codec).split::<(Bytes, SocketAddr)>();
                tokio::spawn(write_loop(
                    sink,
                    out_rx,
                    cancel.clone(),
                    counters.clone(),
                    move |b| (b, peer),
                ));
                tokio::spawn(read_loop(stream, peer, in_tx, cancel.clone(), counters.clone()));
            }
        }

        tracing::info!(%peer, kind = ?config.kind, "link opened");

        Ok(Self {
            sender: LinkSender {
                outbound: out_tx,
                cancel: cancel.clone(),
                counters,
                peer,
            },
            receiver: LinkReceiver {
                inbound: in_rx,
                cancel,
            },
        })
    }

    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (self.sender, self.receiver)
    }
}

impl LinkSender {
    /// Queue one payload. Fails only once the link is closed.
    pub fn send(&self, payload: Bytes) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        self.outbound.send(payload).map_err(|_| Error::Closed)
    }

    /// Serialize `msg` as JSON and queue it.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(msg)?;
        self.send(Bytes::from(payload))
    }

    /// Close the link. Pending and future `recv` calls return [`Error::Closed`].
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(peer = %self.peer, "closing link");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn counters(&self) -> LinkCounters {
        self.counters.snapshot()
    }
}

impl LinkReceiver {
    /// Next payload from the server.
    ///
    /// Returns [`Error::Closed`] once the link is closed or the peer hung
    /// up, and the socket error if the read side failed.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Closed),
            item = self.inbound.recv() => item.unwrap_or(Err(Error::Closed)),
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn write_loop<S, T, F>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    wrap: F,
) where
    S: futures_util::Sink<T, Error = Error> + Unpin,
    F: Fn(Bytes) -> T,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => {
                let Some(payload) = next else { break };
                let len = payload.len();
                match sink.send(wrap(payload)).await {
                    Ok(()) => counters.record_tx(len),
                    Err(Error::FrameTooLarge { size, mtu }) => {
                        tracing::error!(size, mtu, "outgoing message exceeds MTU, not sent");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "link write failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
    tracing::debug!("link writer exiting");
}

async fn read_loop<S>(
    mut stream: S,
    peer: SocketAddr,
    inbound: mpsc::Sender<Result<Bytes, Error>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) where
    S: futures_util::Stream<Item = Result<(Bytes, SocketAddr), Error>> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok((payload, from))) => {
                    if from != peer {
                        tracing::debug!(%from, "ignoring datagram from unknown peer");
                        continue;
                    }
                    counters.record_rx(payload.len());
                    if inbound.send(Ok(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "link read failed");
                    let _ = inbound.send(Err(e)).await;
                    break;
                }
                None => {
                    tracing::info!(%peer, "link closed by peer");
                    break;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
