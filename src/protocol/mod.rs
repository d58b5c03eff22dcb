//! Frame protocol - typed progress events and their NDJSON wire encoding
//!
//! This module provides:
//! - StreamFrame and its payloads
//! - The closed ErrorCode taxonomy and ErrorDetails
//! - NdJsonCodec for encoding frames and tolerant decoding
//! - FrameSink, the terminal-guarded writer for one request

pub mod codec;
pub mod frame;
pub mod sink;

pub use codec::{NdJsonCodec, decode_all};
pub use frame::{
    ErrorCode, ErrorDetails, ErrorFrame, GenerationFrame, HealingFrame, Phase, PhaseFrame, ResultFrame,
    SelfReviewFrame, StreamFrame, ValidationFrame,
};
pub use sink::{FrameSink, SendOutcome};
