use crate::sip::{framing::MessageBuffer, SipMessage};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

impl TransportKind {
    /// Token used in Via headers.
    pub fn via_name(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Tcp => f.write_str("tcp"),
        }
    }
}

pub type InboundReceiver = UnboundedReceiver<SipMessage>;

/// The signaling connection to the registrar.
///
/// Reads are framed into complete messages and delivered on the inbound
/// receiver returned by [`Connection::connect`]; the receiver yields `None`
/// once the connection is closed from either side.
#[derive(Clone)]
pub struct Connection {
    kind: TransportKind,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl Connection {
    pub async fn connect(
        kind: TransportKind,
        remote_addr: SocketAddr,
        parent: &CancellationToken,
    ) -> Result<(Self, InboundReceiver)> {
        let closed = parent.child_token();
        let (outbound, outbound_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();

        let local_addr = match kind {
            TransportKind::Udp => {
                let bind_addr = match remote_addr.ip() {
                    IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(remote_addr).await?;
                let local_addr = socket.local_addr()?;
                tokio::spawn(serve_udp(socket, outbound_rx, inbound_tx, closed.clone()));
                local_addr
            }
            TransportKind::Tcp => {
                let stream = TcpStream::connect(remote_addr).await?;
                stream.set_nodelay(true).ok();
                let local_addr = stream.local_addr()?;
                tokio::spawn(serve_tcp(stream, outbound_rx, inbound_tx, closed.clone()));
                local_addr
            }
        };

        info!(transport = %kind, local = %local_addr, remote = %remote_addr, "sip connection established");
        Ok((
            Self {
                kind,
                local_addr,
                remote_addr,
                outbound,
                closed,
            },
            inbound_rx,
        ))
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn send(&self, message: &SipMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(anyhow!("sip connection closed"));
        }
        self.outbound
            .send(message.to_bytes())
            .map_err(|_| anyhow!("sip connection closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

fn deliver(buffer: &mut MessageBuffer, inbound: &UnboundedSender<SipMessage>) {
    for message in buffer.drain_messages() {
        match message {
            Ok(message) => {
                if inbound.send(message).is_err() {
                    return;
                }
            }
            Err(e) => warn!("dropping malformed sip message: {}", e),
        }
    }
}

async fn serve_udp(
    socket: UdpSocket,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    inbound: UnboundedSender<SipMessage>,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        select! {
            _ = closed.cancelled() => break,
            data = outbound.recv() => {
                let Some(data) = data else { break };
                if let Err(e) = socket.send(&data).await {
                    warn!("sip udp send failed: {}", e);
                }
            }
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        // each datagram carries whole messages
                        let mut buffer = MessageBuffer::new();
                        buffer.extend(&buf[..n]);
                        deliver(&mut buffer, &inbound);
                    }
                    Err(e) => {
                        warn!("sip udp recv failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    closed.cancel();
    debug!("sip udp transport stopped");
}

async fn serve_tcp(
    stream: TcpStream,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    inbound: UnboundedSender<SipMessage>,
    closed: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let writer_token = closed.clone();
    tokio::spawn(async move {
        loop {
            select! {
                _ = writer_token.cancelled() => break,
                data = outbound.recv() => {
                    let Some(data) = data else { break };
                    if let Err(e) = writer.write_all(&data).await {
                        warn!("sip tcp write failed: {}", e);
                        break;
                    }
                }
            }
        }
        writer_token.cancel();
        writer.shutdown().await.ok();
    });

    let mut buffer = MessageBuffer::new();
    let mut buf = vec![0u8; 8192];
    loop {
        select! {
            _ = closed.cancelled() => break,
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        info!("sip tcp connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        buffer.extend(&buf[..n]);
                        deliver(&mut buffer, &inbound);
                    }
                    Err(e) => {
                        warn!("sip tcp read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    closed.cancel();
    debug!("sip tcp transport stopped");
}
