//! Extended code normalization
//!
//! Every key and button the engine sees is identified by a single `i32`
//! that packs the raw platform code together with modifier and device bits:
//!
//! ```text
//! bit 31      pointer device tag (mouse buttons are negated button numbers)
//! bit 19      right-side discriminator (shift only)
//! bit 18      shift held
//! bit 17      alt held
//! bit 16      ctrl held
//! bits 0..16  raw key code
//! ```
//!
//! Modifier bits are only populated when modifier tracking is enabled, so
//! with tracking off the same physical key always yields the same code.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const KEYCODE_MASK: i32 = 0xFFFF;
pub const CTRL_MASK: i32 = 1 << 16;
pub const ALT_MASK: i32 = 1 << 17;
pub const SHIFT_MASK: i32 = 1 << 18;
pub const RIGHT_MASK: i32 = 1 << 19;
pub const MOUSE_MASK: i32 = i32::MIN;

// Raw scan codes as delivered by the native hook
pub const VC_CONTROL: u32 = 0x001D;
pub const VC_CONTROL_R: u32 = 0x0E1D;
pub const VC_ALT: u32 = 0x0038;
pub const VC_ALT_R: u32 = 0x0E38;
pub const VC_SHIFT: u32 = 0x002A;
pub const VC_SHIFT_R: u32 = 0x0E36;

/// Source device of a raw input code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Keyboard,
    Pointer,
}

/// Live (or captured) modifier key state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: false,
    };

    pub fn ctrl() -> Self {
        Self {
            ctrl: true,
            ..Self::NONE
        }
    }

    pub fn has_any(&self) -> bool {
        self.ctrl || self.alt || self.shift
    }

    pub fn bits(&self) -> i32 {
        (if self.ctrl { CTRL_MASK } else { 0 })
            | (if self.alt { ALT_MASK } else { 0 })
            | (if self.shift { SHIFT_MASK } else { 0 })
    }
}

/// Which bare modifier key a code identifies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKey {
    Ctrl,
    Alt,
    Shift,
}

/// Stable key identity used by the registry and the command bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtendedCode(i32);

impl ExtendedCode {
    pub const CTRL: ExtendedCode = ExtendedCode(VC_CONTROL as i32 | CTRL_MASK);
    pub const ALT: ExtendedCode = ExtendedCode(VC_ALT as i32 | ALT_MASK);
    pub const LSHIFT: ExtendedCode = ExtendedCode(VC_SHIFT as i32 | SHIFT_MASK);
    pub const RSHIFT: ExtendedCode = ExtendedCode(VC_SHIFT as i32 | SHIFT_MASK | RIGHT_MASK);

    pub const fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    pub fn is_pointer(self) -> bool {
        self.0 < 0
    }

    /// Raw code with every flag bit stripped. Pointer codes are their own base.
    pub fn base(self) -> i32 {
        if self.is_pointer() {
            self.0
        } else {
            self.0 & KEYCODE_MASK
        }
    }

    pub fn modifiers(self) -> Modifiers {
        if self.is_pointer() {
            return Modifiers::NONE;
        }
        Modifiers {
            ctrl: self.0 & CTRL_MASK != 0,
            alt: self.0 & ALT_MASK != 0,
            shift: self.0 & SHIFT_MASK != 0,
        }
    }

    /// Identifies the canonical bare modifier codes produced with tracking on
    pub fn modifier_key(self) -> Option<ModifierKey> {
        if self == Self::CTRL {
            Some(ModifierKey::Ctrl)
        } else if self == Self::ALT {
            Some(ModifierKey::Alt)
        } else if self == Self::LSHIFT || self == Self::RSHIFT {
            Some(ModifierKey::Shift)
        } else {
            None
        }
    }

    /// Mouse button number for pointer codes
    pub fn button(self) -> Option<u32> {
        match self.0 {
            MOUSE_MASK => Some(0),
            v if v < 0 => Some(v.unsigned_abs()),
            _ => None,
        }
    }
}

impl fmt::Display for ExtendedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(button) = self.button() {
            return write!(f, "M{}", button);
        }
        match self.modifier_key() {
            Some(ModifierKey::Ctrl) => return write!(f, "Ctrl"),
            Some(ModifierKey::Alt) => return write!(f, "Alt"),
            Some(ModifierKey::Shift) if *self == Self::RSHIFT => return write!(f, "RShift"),
            Some(ModifierKey::Shift) => return write!(f, "LShift"),
            None => {}
        }
        let modifiers = self.modifiers();
        if modifiers.ctrl {
            write!(f, "Ctrl + ")?;
        }
        if modifiers.alt {
            write!(f, "Alt + ")?;
        }
        if modifiers.shift {
            write!(f, "Shift + ")?;
        }
        write!(f, "0x{:04X}", self.base())
    }
}

fn classify_raw(raw: u32) -> Option<ExtendedCode> {
    match raw {
        VC_CONTROL | VC_CONTROL_R => Some(ExtendedCode::CTRL),
        VC_ALT | VC_ALT_R => Some(ExtendedCode::ALT),
        VC_SHIFT => Some(ExtendedCode::LSHIFT),
        VC_SHIFT_R => Some(ExtendedCode::RSHIFT),
        _ => None,
    }
}

/// Whether a raw keyboard code is one of the bare modifier keys
pub fn raw_modifier(raw: u32) -> Option<ModifierKey> {
    classify_raw(raw).and_then(ExtendedCode::modifier_key)
}

/// Maps a raw key or button code plus live modifier state to its extended code.
///
/// Unrecognized or out-of-range raw values are masked down to the raw code
/// bits; this never fails.
pub fn normalize(
    raw: u32,
    device: DeviceClass,
    modifiers_enabled: bool,
    live: Modifiers,
) -> ExtendedCode {
    match device {
        DeviceClass::Pointer => {
            let button = (raw & KEYCODE_MASK as u32) as i32;
            if button == 0 {
                ExtendedCode(MOUSE_MASK)
            } else {
                ExtendedCode(-button)
            }
        }
        DeviceClass::Keyboard => {
            if !modifiers_enabled {
                return ExtendedCode((raw & KEYCODE_MASK as u32) as i32);
            }
            if let Some(modifier) = classify_raw(raw) {
                return modifier;
            }
            ExtendedCode((raw & KEYCODE_MASK as u32) as i32 | live.bits())
        }
    }
}

/// Tracks live modifier state from the raw key stream, for input sources
/// that only deliver raw codes.
#[derive(Debug, Default, Clone)]
pub struct ModifierState {
    ctrl: bool,
    alt: bool,
    shift: bool,
}

impl ModifierState {
    pub fn update(&mut self, raw: u32, pressed: bool) {
        match raw_modifier(raw) {
            Some(ModifierKey::Ctrl) => self.ctrl = pressed,
            Some(ModifierKey::Alt) => self.alt = pressed,
            Some(ModifierKey::Shift) => self.shift = pressed,
            None => {}
        }
    }

    pub fn snapshot(&self) -> Modifiers {
        Modifiers {
            ctrl: self.ctrl,
            alt: self.alt,
            shift: self.shift,
        }
    }
}
