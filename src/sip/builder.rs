use super::message::{extract_uri, header_param, Method, SipMessage};
use crate::version::get_useragent;
use std::net::SocketAddr;

pub const BRANCH_MAGIC: &str = "z9hG4bK";
pub const MAX_FORWARDS: &str = "70";

pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, hex::encode(rand::random::<[u8; 8]>()))
}

pub fn new_tag() -> String {
    hex::encode(rand::random::<[u8; 5]>())
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Builds an outbound request. Headers are emitted in call order; `build`
/// fills in `Max-Forwards` and `User-Agent` when absent.
pub struct RequestBuilder {
    message: SipMessage,
    method: Method,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            message: SipMessage::request(method.clone(), uri),
            method,
        }
    }

    pub fn via(mut self, transport: &str, local_addr: SocketAddr, branch: &str) -> Self {
        self.message.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={};rport",
                transport.to_ascii_uppercase(),
                local_addr,
                branch
            ),
        );
        self
    }

    pub fn from(mut self, uri: &str, tag: &str) -> Self {
        self.message
            .add_header("From", format!("<{}>;tag={}", uri, tag));
        self
    }

    pub fn to(mut self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.message.add_header("To", value);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.message.add_header("Call-ID", call_id);
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.message
            .add_header("CSeq", format!("{} {}", seq, self.method));
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.message.add_header("Contact", format!("<{}>", uri));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.message.add_header(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.message.add_header("Content-Type", content_type);
        self.message.body = body;
        self
    }

    pub fn build(mut self) -> SipMessage {
        if self.message.header("max-forwards").is_none() {
            self.message.add_header("Max-Forwards", MAX_FORWARDS);
        }
        if self.message.header("user-agent").is_none() {
            self.message.add_header("User-Agent", get_useragent());
        }
        self.message
    }
}

/// A response to `request` echoing its Via, From, To, Call-ID and CSeq.
///
/// `to_tag` is appended to the To header unless the request already carries
/// one (in-dialog requests).
pub fn response_for(request: &SipMessage, status: u16, to_tag: Option<&str>) -> SipMessage {
    let mut response = SipMessage::response(status, reason_phrase(status));
    for via in request.header_values("via") {
        response.add_header("Via", via);
    }
    if let Some(from) = request.header("from") {
        response.add_header("From", from);
    }
    if let Some(to) = request.header("to") {
        let to = match to_tag {
            Some(tag) if header_param(to, "tag").is_none() => format!("{};tag={}", to, tag),
            _ => to.to_string(),
        };
        response.add_header("To", to);
    }
    if let Some(call_id) = request.call_id() {
        response.add_header("Call-ID", call_id);
    }
    if let Some(cseq) = request.header("cseq") {
        response.add_header("CSeq", cseq);
    }
    response.add_header("User-Agent", get_useragent());
    response
}

/// The Contact URI of a message, without angle brackets or header params.
pub fn contact_uri(message: &SipMessage) -> Option<String> {
    message.header("contact").map(|c| extract_uri(c).to_string())
}
