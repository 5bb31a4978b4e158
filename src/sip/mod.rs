//! Wire-level SIP: message model, stream framing, Digest authentication and
//! request/response builders. Just enough of RFC 3261 for one registrar and a
//! basic inbound call flow.
pub mod builder;
pub mod digest;
pub mod framing;
pub mod message;

pub use message::{Method, SipMessage, StartLine};

pub const SIP_VERSION: &str = "SIP/2.0";
