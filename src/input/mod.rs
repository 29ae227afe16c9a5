//! Input normalization
//!
//! Raw events from the OS hook arrive as `(raw code, device, modifiers)`
//! triples. [`extended_code::normalize`] folds them into a single
//! [`ExtendedCode`] that the key registry and command dispatcher use as
//! identity.
//!
//! ```text
//! Hook ──► InputEvent ──► normalize() ──► ExtendedCode ──► Registry / Commands
//! ```

pub mod extended_code;
pub mod source;

pub use extended_code::{
    normalize, raw_modifier, DeviceClass, ExtendedCode, ModifierKey, ModifierState, Modifiers,
    VC_ALT, VC_CONTROL, VC_SHIFT, VC_SHIFT_R,
};
pub use source::{InputEvent, ReplayError, ReplaySource};
