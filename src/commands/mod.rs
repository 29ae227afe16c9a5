//! Command key recognition
//!
//! Six actions can be bound to a key or chord. Matching is exact equality on
//! the extended code, modifier bits included, and the bindings are checked in
//! a fixed priority order so a press triggers at most one action. A binding
//! fires on the press edge only; OS auto-repeat of a held chord is ignored
//! until the chord key or one of its modifiers is released.

use crate::config::CommandConfig;
use crate::input::{ExtendedCode, ModifierKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandAction {
    ResetStats,
    ResetTotals,
    Exit,
    ToggleVisibility,
    TogglePause,
    ReloadConfig,
}

impl CommandAction {
    /// Dispatch order, highest priority first
    pub const PRIORITY: [CommandAction; 6] = [
        CommandAction::ResetStats,
        CommandAction::Exit,
        CommandAction::ResetTotals,
        CommandAction::ToggleVisibility,
        CommandAction::TogglePause,
        CommandAction::ReloadConfig,
    ];
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandAction::ResetStats => "reset stats",
            CommandAction::ResetTotals => "reset totals",
            CommandAction::Exit => "exit",
            CommandAction::ToggleVisibility => "toggle visibility",
            CommandAction::TogglePause => "toggle pause",
            CommandAction::ReloadConfig => "reload config",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBinding {
    pub action: CommandAction,
    pub bound_code: Option<ExtendedCode>,
}

impl CommandBinding {
    pub fn matches(&self, code: ExtendedCode) -> bool {
        self.bound_code == Some(code)
    }

    /// Whether releasing `code` ends a press of this binding
    fn released_by(&self, code: ExtendedCode) -> bool {
        let Some(bound) = self.bound_code else {
            return false;
        };
        if bound.base() == code.base() {
            return true;
        }
        let modifiers = bound.modifiers();
        match code.modifier_key() {
            Some(ModifierKey::Ctrl) => modifiers.ctrl,
            Some(ModifierKey::Alt) => modifiers.alt,
            Some(ModifierKey::Shift) => modifiers.shift,
            None => false,
        }
    }
}

/// Bindings held in priority order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDispatcher {
    bindings: [CommandBinding; 6],
    held: [bool; 6],
}

impl CommandDispatcher {
    pub fn from_config(config: &CommandConfig) -> Self {
        let bindings = CommandAction::PRIORITY.map(|action| {
            let spec = match action {
                CommandAction::ResetStats => config.reset_stats,
                CommandAction::Exit => config.exit,
                CommandAction::ResetTotals => config.reset_totals,
                CommandAction::ToggleVisibility => config.toggle_visibility,
                CommandAction::TogglePause => config.toggle_pause,
                CommandAction::ReloadConfig => config.reload_config,
            };
            CommandBinding {
                action,
                bound_code: spec.extended_code(),
            }
        });

        for binding in &bindings {
            match binding.bound_code {
                Some(code) => debug!("Command '{}' bound to {}", binding.action, code),
                None => debug!("Command '{}' unbound", binding.action),
            }
        }
        Self {
            bindings,
            held: [false; 6],
        }
    }

    /// Keeps the held state of bindings whose code did not change, so a
    /// chord still down across a reload does not fire again on repeat.
    pub fn carry_over(&mut self, previous: &CommandDispatcher) {
        for (i, binding) in self.bindings.iter().enumerate() {
            if binding.bound_code == previous.bindings[i].bound_code {
                self.held[i] = previous.held[i];
            }
        }
    }

    pub fn bindings(&self) -> &[CommandBinding] {
        &self.bindings
    }

    pub fn binding(&self, action: CommandAction) -> Option<&CommandBinding> {
        self.bindings.iter().find(|b| b.action == action)
    }

    /// First action in priority order bound to `code`, unless that binding
    /// is still held from an earlier press
    pub fn on_key_press(&mut self, code: ExtendedCode) -> Option<CommandAction> {
        let index = self.bindings.iter().position(|binding| binding.matches(code))?;
        let action = self.bindings[index].action;
        if self.held[index] {
            debug!("Command key {} repeated, '{}' already fired", code, action);
            return None;
        }
        self.held[index] = true;
        info!("Command key {} triggered '{}'", code, action);
        Some(action)
    }

    /// Re-arms every binding ended by releasing `code`
    pub fn on_key_release(&mut self, code: ExtendedCode) {
        for (binding, held) in self.bindings.iter().zip(self.held.iter_mut()) {
            if *held && binding.released_by(code) {
                *held = false;
            }
        }
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::from_config(&CommandConfig::default())
    }
}
