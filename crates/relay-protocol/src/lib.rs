//! # flowrelay-protocol
//!
//! Message model and wire format for the flowrelay message relay.
//!
//! Producers submit typed messages which travel over the bus as UTF-8 JSON
//! objects and are later persisted and broadcast by the relay core.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "id": "5b0c7e5e-3c5f-4c0e-9a55-2f6a2e1d9a10",
//!   "username": "alice",
//!   "content": "hi",
//!   "type": "CHAT",
//!   "timestamp": "2024-05-01T09:30:00.123456789"
//! }
//! ```
//!
//! ## Example
//!
//! ```rust
//! use flowrelay_protocol::{codec, Message};
//!
//! let message = Message::chat("alice", "hi").unwrap();
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;
pub mod subjects;

pub use codec::{decode, encode, CodecError};
pub use message::{
    Message, MessageKind, ValidationError, MAX_CONTENT_LENGTH, MAX_SENDER_LENGTH, SYSTEM_SENDER,
    TASK_COMPLETION_MARKER,
};
