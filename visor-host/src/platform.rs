//! Platform collaborator traits — OS screen capture and input
//! injection.
//!
//! These are opaque to the engine beyond the calls below. The
//! embedding application supplies implementations; the engine ships
//! none of its own because capture and injection are host-OS work the
//! session protocol does not depend on.

use visor_core::VisorError;

/// A raw captured screen image, tightly packed RGB (3 bytes/pixel,
/// row-major).
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl RawImage {
    /// Expected byte length for the declared dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Captures the host's screen. Called once per pipeline cycle from a
/// dedicated task; implementations may block briefly.
pub trait ScreenSource: Send + Sync {
    fn capture(&self) -> Result<RawImage, VisorError>;
}

/// Injects remote input into the host OS.
pub trait InputSink: Send + Sync {
    fn inject_mouse(&self, event_type: &str, data: &[u8]) -> Result<(), VisorError>;
    fn inject_keyboard(&self, event_type: &str, data: &[u8]) -> Result<(), VisorError>;
}
