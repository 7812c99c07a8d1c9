pub mod audio_sink;
pub mod audio_source;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod streams;

pub use client::IntercomClient;
pub use config::ClientConfig;
pub use error::{DeviceError, IntercomError, Result};
pub use events::{ClientEvent, TerminationReason};
pub use streams::{StreamSnapshot, StreamState};
