//! Protocol layer: framing and message lifecycle
//!
//! - Fixed-size header: 28 bytes, little-endian, predictable layout
//! - Partial frames stay in the caller's buffer until complete
//! - Opaque messages: payload bytes belong to the message factory

mod encoder;
mod factory;
mod message;

pub use encoder::{Encoder, FrameDecoder};
pub use factory::{FactoryError, Message, MessageFactory, RawMessage, RawMessageFactory};
pub use message::{
    checksum, FrameError, FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC, VERSION,
};
