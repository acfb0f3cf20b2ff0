//! # visor-host
//!
//! The Visor session engine: one host shares its screen and input
//! with multiple authenticated peers over TCP, with chat and file
//! broadcast on the side.
//!
//! The two entry points are [`HostEngine`] (share this machine) and
//! [`ClientEngine`] (view and control a remote one). Both surface
//! everything the presentation layer needs as [`EngineEvent`]s;
//! neither renders anything. Platform capture/injection and
//! persistence are injected through the [`ScreenSource`],
//! [`InputSink`], and [`SessionStore`] traits.

pub mod broadcast;
pub mod capture;
pub mod client;
pub mod config;
pub mod control;
pub mod events;
pub mod host;
pub mod platform;
pub mod registry;
pub mod session;
pub mod store;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::ClientEngine;
pub use config::{CaptureConfig, HostConfig, NetworkConfig, TelemetryConfig};
pub use events::{EngineEvent, EventBus};
pub use host::HostEngine;
pub use platform::{InputSink, RawImage, ScreenSource};
pub use store::{MemoryStore, SessionStore};
