use super::message::{find_header_end, SipMessage};
use anyhow::{anyhow, Result};
use bytes::{Buf, BytesMut};

/// Upper bound on a single header block before the buffer is considered garbage.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Accumulates stream bytes and yields complete SIP messages.
///
/// A message is complete when the blank line after the headers has arrived
/// and `Content-Length` more body bytes follow it. A missing `Content-Length`
/// means an empty body.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete message. `None` means more bytes are needed.
    /// A malformed message is consumed and reported as `Some(Err)`.
    pub fn next_message(&mut self) -> Option<Result<SipMessage>> {
        // CRLF keep-alives between messages
        let leading = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.buf.advance(leading);
        if self.buf.is_empty() {
            return None;
        }

        let (head_end, sep_len) = match find_header_end(&self.buf) {
            Some(found) => found,
            None => {
                if self.buf.len() > MAX_HEADER_SIZE {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    return Some(Err(anyhow!(
                        "sip header block exceeds {} bytes, dropped {}",
                        MAX_HEADER_SIZE,
                        dropped
                    )));
                }
                return None;
            }
        };

        let body_len = match content_length(&self.buf[..head_end]) {
            Ok(len) => len,
            Err(e) => {
                self.buf.advance(head_end + sep_len);
                return Some(Err(e));
            }
        };
        let total = head_end + sep_len + body_len;
        if self.buf.len() < total {
            return None;
        }
        let frame = self.buf.split_to(total);
        Some(SipMessage::parse(&frame))
    }

    /// Every complete message currently buffered, in arrival order.
    pub fn drain_messages(&mut self) -> Vec<Result<SipMessage>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message() {
            messages.push(message);
        }
        messages
    }
}

fn content_length(head: &[u8]) -> Result<usize> {
    let head = String::from_utf8_lossy(head);
    for line in head.split('\n').skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid content-length: {}", value.trim()));
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::Method;

    fn options(call_id: &str, body: &str) -> String {
        format!(
            "OPTIONS sip:a@b SIP/2.0\r\nCall-ID: {}\r\nContent-Length: {}\r\n\r\n{}",
            call_id,
            body.len(),
            body
        )
    }

    #[test]
    fn test_partial_then_complete() {
        let raw = options("one", "hello");
        let mut buffer = MessageBuffer::new();
        buffer.extend(&raw.as_bytes()[..20]);
        assert!(buffer.next_message().is_none());
        buffer.extend(&raw.as_bytes()[20..raw.len() - 2]);
        assert!(buffer.next_message().is_none());
        buffer.extend(&raw.as_bytes()[raw.len() - 2..]);
        let msg = buffer.next_message().unwrap().unwrap();
        assert_eq!(msg.method(), Some(&Method::Options));
        assert_eq!(msg.body, b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_read() {
        let raw = format!("{}{}\r\n\r\n{}", options("1", ""), options("2", "x"), options("3", "yz"));
        let mut buffer = MessageBuffer::new();
        buffer.extend(raw.as_bytes());
        let ids: Vec<String> = buffer
            .drain_messages()
            .into_iter()
            .map(|m| m.unwrap().call_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_missing_content_length_is_empty_body() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(b"SIP/2.0 200 OK\r\nCall-ID: z\r\n\r\nSIP/2.0 180 Ringing\r\n\r\n");
        let first = buffer.next_message().unwrap().unwrap();
        assert_eq!(first.status(), Some(200));
        assert!(first.body.is_empty());
        assert_eq!(buffer.next_message().unwrap().unwrap().status(), Some(180));
    }

    #[test]
    fn test_compact_content_length() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(b"SIP/2.0 200 OK\r\nl: 3\r\n\r\nabc");
        assert_eq!(buffer.next_message().unwrap().unwrap().body, b"abc");
    }

    #[test]
    fn test_malformed_message_is_consumed() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(b"GARBAGE\r\n\r\n");
        buffer.extend(options("ok", "").as_bytes());
        assert!(buffer.next_message().unwrap().is_err());
        let msg = buffer.next_message().unwrap().unwrap();
        assert_eq!(msg.call_id(), Some("ok"));
    }

    #[test]
    fn test_oversized_header_is_dropped() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(&vec![b'a'; MAX_HEADER_SIZE + 1]);
        assert!(buffer.next_message().unwrap().is_err());
        assert!(buffer.is_empty());
    }
}
