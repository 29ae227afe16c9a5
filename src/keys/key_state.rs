use crate::input::{ExtendedCode, Modifiers};
use serde::{Deserialize, Serialize};

/// Press/release state and running count for one tracked key or button
#[derive(Debug, Clone, PartialEq)]
pub struct KeyState {
    code: ExtendedCode,
    name: String,
    visible: bool,
    count: u64,
    is_down: bool,
    modifiers_at_press: Modifiers,
}

impl KeyState {
    pub fn new(code: ExtendedCode, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            visible: true,
            count: 0,
            is_down: false,
            modifiers_at_press: code.modifiers(),
        }
    }

    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn code(&self) -> ExtendedCode {
        self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_down(&self) -> bool {
        self.is_down
    }

    pub fn modifiers_at_press(&self) -> Modifiers {
        self.modifiers_at_press
    }

    /// Registers a press edge. Returns `false` for repeats while held.
    pub fn press(&mut self) -> bool {
        if self.is_down {
            return false;
        }
        self.count += 1;
        self.is_down = true;
        self.modifiers_at_press = self.code.modifiers();
        true
    }

    /// Registers a release. Returns `true` if the key was down.
    pub fn release(&mut self) -> bool {
        std::mem::replace(&mut self.is_down, false)
    }

    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// Copies the runtime state of a previous incarnation of this key
    pub(crate) fn carry_over(&mut self, previous: &KeyState) {
        self.count = previous.count;
        self.is_down = previous.is_down;
        self.modifiers_at_press = previous.modifiers_at_press;
    }

    pub fn to_count(&self) -> KeyCount {
        KeyCount {
            code: self.code,
            name: self.name.clone(),
            count: self.count,
            down: self.is_down,
            visible: self.visible,
        }
    }
}

/// Read-only per-key view handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCount {
    pub code: ExtendedCode,
    pub name: String,
    pub count: u64,
    pub down: bool,
    pub visible: bool,
}
