//! Controller state and the frames it is encoded into.
//!
//! A [`Frame`] is what actually crosses the arbiter: an opaque, immutable
//! byte payload that is written in one piece. The arbiter and the transport
//! never look inside it. [`ControllerState`] is the shared vocabulary of the
//! keyboard and pointer bridges and of the builtin commands; it encodes into
//! the fixed-width text line understood by the controller firmware:
//!
//! ```text
//! 0x0004 8 80 80 80 80\r\n
//! │      │ │  │  │  └─ right stick y
//! │      │ │  │  └──── right stick x
//! │      │ │  └─────── left stick y
//! │      │ └────────── left stick x
//! │      └──────────── hat (0-7 clockwise from top, 8 = center)
//! └─────────────────── button bitmask
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One atomic controller update as written to the transport.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    bytes: Arc<[u8]>,
}

impl Frame {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    /// A single text line (`\r\n` appended), as used by firmware sync commands.
    pub fn line(text: &str) -> Self {
        Self::new(format!("{text}\r\n"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

impl From<&ControllerState> for Frame {
    fn from(state: &ControllerState) -> Self {
        Frame::new(format!(
            "{:#06x} {} {:02x} {:02x} {:02x} {:02x}\r\n",
            state.buttons,
            state.hat as u8,
            state.left.x,
            state.left.y,
            state.right.x,
            state.right.y
        ))
    }
}

/// Digital buttons of the controller, in firmware bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Y,
    B,
    A,
    X,
    L,
    R,
    Zl,
    Zr,
    Minus,
    Plus,
    LClick,
    RClick,
    Home,
    Capture,
}

impl Button {
    pub fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

/// Directional pad position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hat {
    Top = 0,
    TopRight = 1,
    Right = 2,
    BottomRight = 3,
    Bottom = 4,
    BottomLeft = 5,
    Left = 6,
    TopLeft = 7,
    #[default]
    Center = 8,
}

/// Which analog stick an input drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StickSide {
    #[default]
    Left,
    Right,
}

/// Raw analog stick position, 0..=255 per axis with 0x80 at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stick {
    pub x: u8,
    pub y: u8,
}

impl Stick {
    pub const CENTER: Stick = Stick { x: 0x80, y: 0x80 };

    /// Builds a stick position from normalized axes in -1.0..=1.0.
    ///
    /// Positive `y` points down, matching screen coordinates and the firmware.
    pub fn from_normalized(x: f32, y: f32) -> Self {
        Self {
            x: axis_to_raw(x),
            y: axis_to_raw(y),
        }
    }
}

impl Default for Stick {
    fn default() -> Self {
        Self::CENTER
    }
}

fn axis_to_raw(value: f32) -> u8 {
    if value.is_nan() {
        return Stick::CENTER.x;
    }
    let normalized = value.clamp(-1.0, 1.0);
    // -1.0 -> 0, 0.0 -> 128, 1.0 -> 255
    let raw = if normalized <= 0.0 {
        128.0 + normalized * 128.0
    } else {
        128.0 + normalized * 127.0
    };
    raw.round() as u8
}

/// Complete controller state sent with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControllerState {
    pub buttons: u16,
    pub hat: Hat,
    pub left: Stick,
    pub right: Stick,
}

impl ControllerState {
    /// Everything released, hat centered, both sticks at rest.
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn press(&mut self, button: Button) {
        self.buttons |= button.mask();
    }

    pub fn release(&mut self, button: Button) {
        self.buttons &= !button.mask();
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.buttons & button.mask() != 0
    }

    pub fn set_stick(&mut self, side: StickSide, stick: Stick) {
        match side {
            StickSide::Left => self.left = stick,
            StickSide::Right => self.right = stick,
        }
    }

    pub fn stick(&self, side: StickSide) -> Stick {
        match side {
            StickSide::Left => self.left,
            StickSide::Right => self.right,
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame::from(self)
    }
}
