//! # Intercom Protocol
//!
//! Line-delimited JSON protocol spoken between an intercom client and its hub.
//!
//! This crate provides:
//! - Message definitions for every protocol `type` (serde, tagged by `type`)
//! - The negotiated PCM [`AudioFormat`] and its frame size arithmetic
//! - [`JsonConnection`], an async framed connection safe for concurrent senders
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use intercom_protocol::{JsonConnection, Message, HOME_ASSISTANT_ROLE};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), intercom_protocol::ProtocolError> {
//! let connection = JsonConnection::connect("127.0.0.1:7000", Duration::from_secs(5)).await?;
//!
//! connection
//!     .send(&Message::Register {
//!         role: HOME_ASSISTANT_ROLE.to_string(),
//!         client_id: "kitchen".to_string(),
//!     })
//!     .await?;
//!
//! loop {
//!     match connection.receive_message().await? {
//!         Message::Close => break,
//!         other => println!("Received {}", other.kind()),
//!     }
//! }
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod protocol;

// Re-export commonly used types
pub use connection::{JsonConnection, MAX_LINE_BYTES};
pub use protocol::{
    AudioFormat, AudioFrame, Direction, Message, ProtocolError, HOME_ASSISTANT_ROLE, PCM_S16LE,
};
