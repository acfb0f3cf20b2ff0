//! # visor-core
//!
//! Wire protocol library for the Visor remote-desktop session engine.
//!
//! This crate contains:
//! - **Frame types**: [`ClientFrame`] and [`HostFrame`], the two
//!   direction-specific message sets multiplexed over one socket
//! - **Codecs**: [`HostCodec`] and [`ClientCodec`] for framed TCP I/O
//!   via `tokio_util`
//! - **Error**: [`VisorError`] — typed, `thiserror`-based error hierarchy
//!   shared by the protocol and the engine crates
//!
//! The wire format is fixed and hand-framed (big-endian lengths, no
//! serde on the socket): every frame starts with a 4-byte kind tag,
//! strings are `u16`-length-prefixed UTF-8, byte payloads are
//! `u32`-length-prefixed.

pub mod codec;
pub mod error;
pub mod frame;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{validate_str, ClientCodec, HostCodec, MAX_FRAME_SIZE, MAX_STRING_BYTES};
pub use error::VisorError;
pub use frame::{ClientFrame, FrameKind, HostFrame};
