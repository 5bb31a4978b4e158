use super::SIP_VERSION;
use anyhow::{anyhow, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Other(m) => m.as_str(),
        }
    }
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipMessage {
    pub start: StartLine,
    /// Headers in wire order. Names keep their original spelling.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Expand RFC 3261 compact header names.
fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "via",
        "f" | "F" => "from",
        "t" | "T" => "to",
        "i" | "I" => "call-id",
        "m" | "M" => "contact",
        "l" | "L" => "content-length",
        "c" | "C" => "content-type",
        "k" | "K" => "supported",
        "e" | "E" => "content-encoding",
        "s" | "S" => "subject",
        _ => name,
    }
}

fn same_header(a: &str, b: &str) -> bool {
    canonical_name(a).eq_ignore_ascii_case(canonical_name(b))
}

impl SipMessage {
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Parse one complete message (headers + exactly the body bytes).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = match find_header_end(data) {
            Some((end, sep_len)) => (&data[..end], &data[end + sep_len..]),
            None => (data, &data[data.len()..]),
        };
        let head = std::str::from_utf8(head).map_err(|_| anyhow!("sip header is not utf-8"))?;
        let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));

        let first = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("missing start line"))?;
        let start = parse_start_line(first)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous header
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => return Err(anyhow!("continuation line without header")),
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed header line: {}", line))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(anyhow!("empty header name"));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            start,
            headers,
            body: body.to_vec(),
        })
    }

    /// Serialize; `Content-Length` always reflects the body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} {}\r\n", method, uri, SIP_VERSION));
            }
            StartLine::Response { status, reason } => {
                out.push_str(&format!("{} {} {}\r\n", SIP_VERSION, status, reason));
            }
        }
        for (name, value) in self
            .headers
            .iter()
            .filter(|(name, _)| !same_header(name, "content-length"))
        {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri.as_str()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }

    /// First value of a header, case-insensitive, compact forms accepted.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| same_header(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| same_header(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace the first occurrence (dropping any others) or append.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|(n, _)| same_header(n, name)) {
            Some(idx) => {
                self.headers[idx].1 = value;
                let mut i = 0;
                self.headers.retain(|(n, _)| {
                    let keep = i <= idx || !same_header(n, name);
                    i += 1;
                    keep
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    /// `CSeq: 2 REGISTER` -> (2, Register)
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from(parts.next()?);
        Some((seq, method))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = code
            .parse::<u16>()
            .map_err(|_| anyhow!("invalid status code: {}", code))?;
        if !(100..700).contains(&status) {
            return Err(anyhow!("status code out of range: {}", status));
        }
        return Ok(StartLine::Response {
            status,
            reason: reason.trim().to_string(),
        });
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [method, uri, version] if *version == SIP_VERSION => Ok(StartLine::Request {
            method: Method::from(*method),
            uri: uri.to_string(),
        }),
        _ => Err(anyhow!("invalid request line: {}", line)),
    }
}

/// Offset of the blank line ending the header block and its separator length.
pub(crate) fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = data.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = data.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

fn user_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:sips?|tel):([^@;>\s:]+)").ok())
        .as_ref()
}

/// Best-effort user part of the first `sip:user@host` (or `tel:number`) in a
/// header value or URI.
pub fn extract_user(value: &str) -> Option<String> {
    user_regex()?
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// The URI inside `<...>` if present, otherwise the value up to the first `;`.
pub fn extract_uri(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return &value[start + 1..end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// A `;name=value` parameter from a header value (e.g. `tag`, `branch`, `expires`).
pub fn header_param(value: &str, name: &str) -> Option<String> {
    // skip parameters inside <...>, they belong to the URI
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=').unwrap_or((param, ""));
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:442012345678@sip.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
        v: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKfirst\r\n\
        Max-Forwards: 70\r\n\
        f: \"Alice\" <sip:441234@x>;tag=1928301774\r\n\
        To: <sip:442012345678@x>\r\n\
        i: a84b4c76e66710@pc33\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        l: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn test_parse_request_with_compact_headers() {
        let msg = SipMessage::parse(INVITE.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(&Method::Invite));
        assert_eq!(msg.uri(), Some("sip:442012345678@sip.example.com"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33"));
        assert_eq!(msg.cseq(), Some((314159, Method::Invite)));
        assert_eq!(msg.header("FROM"), Some("\"Alice\" <sip:441234@x>;tag=1928301774"));
        assert_eq!(msg.header_values("via").count(), 2);
        assert_eq!(msg.content_length(), Some(4));
        assert_eq!(msg.body, b"v=0\n");
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 401 Unauthorized\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.status(), Some(401));
        assert_eq!(msg.reason(), Some("Unauthorized"));
        assert!(!msg.is_request());
    }

    #[test]
    fn test_parse_folded_header() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nSubject: hello\r\n  world\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.header("s"), Some("hello world"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SipMessage::parse(b"").is_err());
        assert!(SipMessage::parse(b"HELLO\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"SIP/2.0 abc Bad\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:a SIP/2.0\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn test_serialize_sets_content_length() {
        let mut msg = SipMessage::request(Method::Options, "sip:example.com");
        msg.add_header("Call-ID", "abc");
        msg.add_header("Content-Length", "999");
        msg.body = b"hello".to_vec();
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.starts_with("OPTIONS sip:example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nhello"));
        assert!(!text.contains("999"));
        let parsed = SipMessage::parse(text.as_bytes()).unwrap();
        assert_eq!(parsed.call_id(), Some("abc"));
    }

    #[test]
    fn test_set_header_replaces_all() {
        let mut msg = SipMessage::response(200, "OK");
        msg.add_header("To", "a");
        msg.add_header("t", "b");
        msg.set_header("To", "c");
        assert_eq!(msg.header_values("to").collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_extract_helpers() {
        assert_eq!(extract_user("\"Bob\" <sip:441234@x>;tag=1"), Some("441234".to_string()));
        assert_eq!(extract_user("sip:+442012345678@10.0.0.1:5060"), Some("+442012345678".to_string()));
        assert_eq!(extract_user("<tel:+15551234>"), Some("+15551234".to_string()));
        assert_eq!(extract_user("<sip:x.example.com>"), Some("x.example.com".to_string()));
        assert_eq!(extract_user("anonymous"), None);
        assert_eq!(extract_uri("\"Bob\" <sip:b@x;transport=tcp>;tag=1"), "sip:b@x;transport=tcp");
        assert_eq!(header_param("<sip:b@x;lr>;tag=abc", "tag"), Some("abc".to_string()));
        assert_eq!(header_param("<sip:b@x;tag=inner>", "tag"), None);
        assert_eq!(
            header_param("SIP/2.0/UDP h;branch=z9hG4bK1;rport", "branch"),
            Some("z9hG4bK1".to_string())
        );
    }
}
