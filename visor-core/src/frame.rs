//! Frame types for the Visor session protocol.
//!
//! Six message kinds are multiplexed over one socket, plus the
//! handshake reply and the two control notifications. The same kind
//! tags are used in both directions, but the payloads differ, so the
//! two directions are modelled as separate enums:
//!
//! - [`ClientFrame`] — what a peer sends to the host
//! - [`HostFrame`] — what the host sends to a peer
//!
//! Frames are immutable once constructed and carry no identity beyond
//! their content.

use bytes::Bytes;

use crate::error::VisorError;

// ── Kind tags ────────────────────────────────────────────────────

/// The kind of a protocol frame. Encoded as a big-endian `u32` tag at
/// the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Authenticate,
    Chat,
    File,
    Screen,
    Mouse,
    Keyboard,
    ControlGrant,
    ControlRevoke,
    Disconnect,
}

impl FrameKind {
    /// The wire tag for this kind.
    pub fn tag(self) -> u32 {
        match self {
            FrameKind::Authenticate => 0,
            FrameKind::Chat => 1,
            FrameKind::File => 2,
            FrameKind::Screen => 3,
            FrameKind::Mouse => 4,
            FrameKind::Keyboard => 5,
            FrameKind::ControlGrant => 6,
            FrameKind::ControlRevoke => 7,
            FrameKind::Disconnect => 8,
        }
    }

    /// Parse a wire tag back into a kind.
    pub fn from_tag(tag: u32) -> Result<Self, VisorError> {
        Ok(match tag {
            0 => FrameKind::Authenticate,
            1 => FrameKind::Chat,
            2 => FrameKind::File,
            3 => FrameKind::Screen,
            4 => FrameKind::Mouse,
            5 => FrameKind::Keyboard,
            6 => FrameKind::ControlGrant,
            7 => FrameKind::ControlRevoke,
            8 => FrameKind::Disconnect,
            other => return Err(VisorError::UnknownKind { tag: other }),
        })
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameKind::Authenticate => "Authenticate",
            FrameKind::Chat => "Chat",
            FrameKind::File => "File",
            FrameKind::Screen => "ScreenFrame",
            FrameKind::Mouse => "MouseEvent",
            FrameKind::Keyboard => "KeyboardEvent",
            FrameKind::ControlGrant => "ControlGrant",
            FrameKind::ControlRevoke => "ControlRevoke",
            FrameKind::Disconnect => "Disconnect",
        };
        write!(f, "{name}")
    }
}

// ── Client → Host frames ─────────────────────────────────────────

/// A frame sent from a connected peer to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// First frame of every connection: shared secret and requested
    /// display name.
    Authenticate { password: String, name: String },

    /// A chat line. The host stamps the sender on fan-out.
    Chat { content: String },

    /// A file relayed to every other peer.
    File { name: String, data: Bytes },

    /// A mouse event for injection (only honoured for the control
    /// holder).
    Mouse { event_type: String, data: Bytes },

    /// A keyboard event for injection (only honoured for the control
    /// holder).
    Keyboard { event_type: String, data: Bytes },

    /// Graceful goodbye; no body.
    Disconnect,
}

impl ClientFrame {
    /// The wire kind of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            ClientFrame::Authenticate { .. } => FrameKind::Authenticate,
            ClientFrame::Chat { .. } => FrameKind::Chat,
            ClientFrame::File { .. } => FrameKind::File,
            ClientFrame::Mouse { .. } => FrameKind::Mouse,
            ClientFrame::Keyboard { .. } => FrameKind::Keyboard,
            ClientFrame::Disconnect => FrameKind::Disconnect,
        }
    }
}

// ── Host → Client frames ─────────────────────────────────────────

/// A frame sent from the host to a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFrame {
    /// Handshake reply. Shares the `Authenticate` kind tag.
    AuthResult { success: bool, message: String },

    /// A chat line fanned out from another peer (or the host itself).
    Chat { sender: String, content: String },

    /// A file fanned out from another peer.
    File {
        sender: String,
        name: String,
        data: Bytes,
    },

    /// The latest encoded screen image.
    Screen { data: Bytes },

    /// This peer now holds exclusive input control. No body.
    ControlGrant,

    /// This peer no longer holds input control. No body.
    ControlRevoke,
}

impl HostFrame {
    /// The wire kind of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            HostFrame::AuthResult { .. } => FrameKind::Authenticate,
            HostFrame::Chat { .. } => FrameKind::Chat,
            HostFrame::File { .. } => FrameKind::File,
            HostFrame::Screen { .. } => FrameKind::Screen,
            HostFrame::ControlGrant => FrameKind::ControlGrant,
            HostFrame::ControlRevoke => FrameKind::ControlRevoke,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
