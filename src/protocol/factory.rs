//! Message lifecycle
//!
//! The transport never interprets payload bytes. For every complete frame it
//! asks a [`MessageFactory`] for an instance of the frame's type, lets the
//! instance decode itself, forwards it and returns it through
//! [`MessageFactory::destroy`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("unknown message type {0}")]
    UnknownType(i32),

    #[error("failed to decode message type {msg_type}: {reason}")]
    Decode { msg_type: i32, reason: String },

    #[error("message of type {actual} returned as type {expected}")]
    TypeMismatch { expected: i32, actual: i32 },
}

pub trait Message: Any {
    fn message_type(&self) -> i32;

    /// Append the payload bytes to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Replace this message's content with `payload`.
    fn decode(&mut self, payload: &[u8]) -> Result<(), FactoryError>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<'a> dyn Message + 'a {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

pub trait MessageFactory {
    fn create(&self, msg_type: i32) -> Result<Box<dyn Message>, FactoryError>;

    fn destroy(&self, msg_type: i32, message: Box<dyn Message>) -> Result<(), FactoryError> {
        if message.message_type() != msg_type {
            return Err(FactoryError::TypeMismatch {
                expected: msg_type,
                actual: message.message_type(),
            });
        }
        Ok(())
    }
}

/// Opaque message: the payload is carried byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    msg_type: i32,
    payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(msg_type: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl Message for RawMessage {
    fn message_type(&self) -> i32 {
        self.msg_type
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.payload);
    }

    fn decode(&mut self, payload: &[u8]) -> Result<(), FactoryError> {
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

const MAX_POOLED_BUFFERS: usize = 256;

/// Factory for [`RawMessage`].
///
/// Accepts every type unless restricted with [`RawMessageFactory::with_types`].
/// Payload buffers of destroyed messages are pooled and reused by `create`.
#[derive(Default)]
pub struct RawMessageFactory {
    allowed: Option<HashSet<i32>>,
    pool: RefCell<Vec<Vec<u8>>>,
}

impl RawMessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(types: impl IntoIterator<Item = i32>) -> Self {
        Self {
            allowed: Some(types.into_iter().collect()),
            pool: RefCell::new(Vec::new()),
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.borrow().len()
    }
}

impl MessageFactory for RawMessageFactory {
    fn create(&self, msg_type: i32) -> Result<Box<dyn Message>, FactoryError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&msg_type) {
                return Err(FactoryError::UnknownType(msg_type));
            }
        }
        let payload = self.pool.borrow_mut().pop().unwrap_or_default();
        Ok(Box::new(RawMessage { msg_type, payload }))
    }

    fn destroy(&self, msg_type: i32, message: Box<dyn Message>) -> Result<(), FactoryError> {
        let actual = message.message_type();
        if actual != msg_type {
            return Err(FactoryError::TypeMismatch {
                expected: msg_type,
                actual,
            });
        }
        // Foreign message types are simply dropped.
        if let Ok(raw) = message.into_any().downcast::<RawMessage>() {
            let mut pool = self.pool.borrow_mut();
            if pool.len() < MAX_POOLED_BUFFERS {
                let mut payload = raw.into_payload();
                payload.clear();
                pool.push(payload);
            }
        }
        Ok(())
    }
}
