//! Input events delivered by the external hook, plus a line based replay
//! source that drives the engine from text (stdin, recorded sessions, tests).
//!
//! Replay protocol, one event per line:
//!
//! ```text
//! press key 0x1E      # key press, raw code in hex or decimal
//! release key 30
//! press mouse 1       # mouse button
//! move 640 480        # cursor position
//! # comments and blank lines are skipped
//! ```

use crate::input::extended_code::{DeviceClass, ModifierState, Modifiers};
use tracing::debug;

/// Raw event as delivered by the input hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Press {
        raw: u32,
        device: DeviceClass,
        modifiers: Modifiers,
    },
    Release {
        raw: u32,
        device: DeviceClass,
        modifiers: Modifiers,
    },
    CursorMoved {
        x: i32,
        y: i32,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Unknown event kind on line {line}: {kind}")]
    UnknownKind { line: usize, kind: String },

    #[error("Unknown device on line {line}: {device}")]
    UnknownDevice { line: usize, device: String },

    #[error("Missing field on line {line}")]
    MissingField { line: usize },

    #[error("Invalid number on line {line}: {value}")]
    InvalidNumber { line: usize, value: String },
}

/// Turns replay lines into [`InputEvent`]s, tracking modifier state from
/// the key stream itself.
#[derive(Debug, Default)]
pub struct ReplaySource {
    modifiers: ModifierState,
    line: usize,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line. Blank lines and comments yield `Ok(None)`.
    pub fn parse_line(&mut self, text: &str) -> Result<Option<InputEvent>, ReplayError> {
        self.line += 1;
        let line = self.line;
        let text = text.split('#').next().unwrap_or_default().trim();
        if text.is_empty() {
            return Ok(None);
        }

        let mut fields = text.split_whitespace();
        let kind = fields.next().ok_or(ReplayError::MissingField { line })?;

        let event = match kind {
            "press" | "release" => {
                let pressed = kind == "press";
                let device = match fields.next().ok_or(ReplayError::MissingField { line })? {
                    "key" => DeviceClass::Keyboard,
                    "mouse" => DeviceClass::Pointer,
                    other => {
                        return Err(ReplayError::UnknownDevice {
                            line,
                            device: other.to_string(),
                        })
                    }
                };
                let raw = parse_number(fields.next(), line)?;
                let raw = u32::try_from(raw).map_err(|_| ReplayError::InvalidNumber {
                    line,
                    value: raw.to_string(),
                })?;

                // Modifier state as seen by the key itself, before it changes
                let modifiers = self.modifiers.snapshot();
                if device == DeviceClass::Keyboard {
                    self.modifiers.update(raw, pressed);
                }

                if pressed {
                    InputEvent::Press {
                        raw,
                        device,
                        modifiers,
                    }
                } else {
                    InputEvent::Release {
                        raw,
                        device,
                        modifiers,
                    }
                }
            }
            "move" => {
                let x = parse_number(fields.next(), line)?;
                let y = parse_number(fields.next(), line)?;
                InputEvent::CursorMoved {
                    x: to_i32(x, line)?,
                    y: to_i32(y, line)?,
                }
            }
            other => {
                return Err(ReplayError::UnknownKind {
                    line,
                    kind: other.to_string(),
                })
            }
        };

        debug!("Replay line {} parsed: {:?}", line, event);
        Ok(Some(event))
    }
}

fn parse_number(field: Option<&str>, line: usize) -> Result<i64, ReplayError> {
    let field = field.ok_or(ReplayError::MissingField { line })?;
    let parsed = match field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => field.parse::<i64>(),
    };
    parsed.map_err(|_| ReplayError::InvalidNumber {
        line,
        value: field.to_string(),
    })
}

fn to_i32(value: i64, line: usize) -> Result<i32, ReplayError> {
    i32::try_from(value).map_err(|_| ReplayError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}
