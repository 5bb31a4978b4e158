pub mod app;
pub mod call;
pub mod config;
pub mod handler;
pub mod llm;
pub mod media;
pub mod net_tool;
pub mod numbers;
pub mod sip;
pub mod synthesis;
pub mod useragent;
pub mod version;

pub type Sample = i16;
pub type PcmBuf = Vec<Sample>;
