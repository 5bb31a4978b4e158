pub mod codecs;
pub mod rtp;
pub mod sdp;
