use super::codecs::CodecType;
use std::net::{IpAddr, SocketAddr};

/// Codecs offered in every answer, in preference order.
pub const OFFERED_CODECS: [CodecType; 3] =
    [CodecType::PCMU, CodecType::PCMA, CodecType::TelephoneEvent];

/// Extract the remote RTP endpoint (connection address + audio port) from an SDP blob.
///
/// A media-level `c=` line overrides the session-level one. A rejected media
/// stream (port 0) or a non-IP connection address yields `None`.
pub fn parse_remote_endpoint(sdp: &str) -> Option<SocketAddr> {
    let mut session_ip: Option<IpAddr> = None;
    let mut media_ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut in_media = false;
    let mut in_audio = false;

    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("m=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            in_media = true;
            in_audio = parts.first() == Some(&"audio");
            if in_audio && port.is_none() {
                port = parts.get(1).and_then(|p| p.split('/').next()?.parse().ok());
            }
            continue;
        }
        // c=IN IP4 192.168.1.100
        if let Some(rest) = line.strip_prefix("c=") {
            let ip = rest
                .split_whitespace()
                .nth(2)
                .and_then(|addr| addr.split('/').next()?.parse::<IpAddr>().ok());
            if !in_media {
                session_ip = ip.or(session_ip);
            } else if in_audio && media_ip.is_none() {
                media_ip = ip;
            }
        }
    }

    match (media_ip.or(session_ip), port) {
        (Some(ip), Some(p)) if p != 0 => Some(SocketAddr::new(ip, p)),
        _ => None,
    }
}

/// Build the 200 OK answer advertising PCMU/PCMA/telephone-event on `port`.
pub fn build_answer(local_ip: IpAddr, port: u16, session_id: u64) -> String {
    let family = match local_ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    let formats = OFFERED_CODECS
        .iter()
        .map(|c| c.payload_type().to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=sipvoice {} {} IN {} {}\r\n",
        session_id, session_id, family, local_ip
    ));
    sdp.push_str("s=sipvoice\r\n");
    sdp.push_str(&format!("c=IN {} {}\r\n", family, local_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=audio {} RTP/AVP {}\r\n", port, formats));
    for codec in OFFERED_CODECS.iter() {
        sdp.push_str(&format!(
            "a=rtpmap:{} {}/{}\r\n",
            codec.payload_type(),
            codec.rtpmap_name(),
            codec.clock_rate()
        ));
    }
    sdp.push_str("a=fmtp:101 0-16\r\n");
    sdp.push_str("a=ptime:20\r\n");
    sdp.push_str("a=sendrecv\r\n");
    sdp
}
