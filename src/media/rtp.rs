use super::codecs::{CodecType, ULAW_SILENCE};
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
/// 20 ms of 8 kHz audio.
pub const SAMPLES_PER_FRAME: usize = 160;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Builds RTP packets for one outbound stream.
///
/// Sequence number and timestamp start at random values and wrap modulo
/// their bit width; the timestamp advances by one frame per packet.
#[derive(Debug, Clone)]
pub struct RtpPacketizer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload_type: u8,
}

impl Default for RtpPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpPacketizer {
    pub fn new() -> Self {
        Self::with_state(rand::random(), rand::random(), rand::random())
    }

    pub fn with_state(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
            payload_type: CodecType::PCMU.payload_type(),
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Serialize one packet with the current counters, then advance them.
    pub fn packetize(&mut self, payload: &[u8], marker: bool) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        // V=2, P=0, X=0, CC=0
        packet.push(RTP_VERSION << 6);
        let marker_bit = if marker { 0x80 } else { 0x00 };
        packet.push(marker_bit | (self.payload_type & 0x7F));
        // writes into a Vec cannot fail
        let _ = packet.write_u16::<BigEndian>(self.sequence);
        let _ = packet.write_u32::<BigEndian>(self.timestamp);
        let _ = packet.write_u32::<BigEndian>(self.ssrc);
        packet.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
        packet
    }
}

/// Split µ-law audio into 160-byte frames, padding the last one with silence.
pub fn split_frames(ulaw: &[u8]) -> Vec<Vec<u8>> {
    ulaw.chunks(SAMPLES_PER_FRAME)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(SAMPLES_PER_FRAME, ULAW_SILENCE);
            frame
        })
        .collect()
}

/// One call leg's media: a UDP socket that streams paced PCMU to the far end.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: Arc<Mutex<SocketAddr>>,
    packetizer: tokio::sync::Mutex<RtpPacketizer>,
    closed: AtomicBool,
    streaming: AtomicBool,
    cancel_token: CancellationToken,
}

pub type RtpSessionRef = Arc<RtpSession>;

impl RtpSession {
    /// Bind an ephemeral local port and start watching for the first inbound
    /// datagram, whose source replaces the SDP-advertised remote endpoint.
    pub async fn open(
        remote_addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<RtpSessionRef> {
        let bind_addr = match remote_addr.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| anyhow!("failed to bind rtp socket: {}", e))?,
        );
        let local_addr = socket.local_addr()?;
        let session = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            remote_addr: Arc::new(Mutex::new(remote_addr)),
            packetizer: tokio::sync::Mutex::new(RtpPacketizer::new()),
            closed: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            cancel_token,
        });

        let token = session.cancel_token.clone();
        let remote = session.remote_addr.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut learned = false;
            loop {
                select! {
                    _ = token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((_, from)) if !learned => {
                                learned = true;
                                if let Ok(mut addr) = remote.lock() {
                                    if *addr != from {
                                        info!(sdp = %*addr, observed = %from, "rtp remote address learned");
                                        *addr = from;
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!("rtp recv error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        debug!(local = %local_addr, remote = %remote_addr, "rtp session opened");
        Ok(session)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
            .lock()
            .map(|addr| *addr)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Stream one utterance of µ-law audio, one 20 ms frame per packet.
    ///
    /// Sends are scheduled against wall-clock ticks so the utterance lasts
    /// `frames * 20ms` regardless of send latency. The closed flag is checked
    /// before each packet. Returns the number of packets sent.
    pub async fn stream_audio(&self, ulaw: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let frames = split_frames(ulaw);
        let mut packetizer = self.packetizer.lock().await;
        self.streaming.store(true, Ordering::SeqCst);

        let mut ticker = interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ticker.tick().await;

        let mut sent = 0;
        let mut result = Ok(());
        for (i, frame) in frames.iter().enumerate() {
            if self.is_closed() || self.cancel_token.is_cancelled() {
                debug!(sent, total = frames.len(), "rtp stream stopped by close");
                break;
            }
            let packet = packetizer.packetize(frame, i == 0);
            let remote = self.remote_addr();
            if let Err(e) = self.socket.send_to(&packet, remote).await {
                warn!(remote = %remote, sent, "rtp send failed: {}", e);
                result = Err(anyhow!("rtp send failed: {}", e));
                break;
            }
            sent += 1;
            select! {
                _ = self.cancel_token.cancelled() => {}
                _ = ticker.tick() => {}
            }
        }
        self.streaming.store(false, Ordering::SeqCst);
        result.map(|_| sent)
    }

    /// Idempotent; an in-progress stream exits before its next packet.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel_token.cancel();
            debug!(local = %self.local_addr, "rtp session closed");
        }
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "rtp_tests.rs"]
mod tests;
