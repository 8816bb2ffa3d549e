//! PTP-over-USB transport core for an MTP client.
//!
//! This crate turns a freshly enumerated USB device into a reliable,
//! concurrency-safe MTP session: interface probing, the PTP wire codec, the
//! bulk-transfer transaction engine, a device quirk policy resolver, and the
//! [`Link`](link::Link) object higher-level file/storage/object operations
//! are built on. Hot-plug watching, persistent indexing, and CLI/config-file
//! loading live outside this crate; see [`backend::UsbBackend`] for the seam.

pub mod backend;
pub mod config;
pub mod context;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod events;
pub mod ladder;
pub mod link;
pub mod policy;
pub mod probe;
pub mod wire;

pub use error::{CodecError, MtpError, TransportError};
