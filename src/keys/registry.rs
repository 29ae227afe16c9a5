use crate::config::KeyEntry;
use crate::input::{ExtendedCode, ModifierKey};
use crate::keys::key_state::{KeyCount, KeyState};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which device classes get a [`KeyState`] created on first press
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackAll {
    pub keys: bool,
    pub buttons: bool,
}

impl TrackAll {
    pub fn covers(&self, code: ExtendedCode) -> bool {
        if code.is_pointer() {
            self.buttons
        } else {
            self.keys
        }
    }
}

/// Result of feeding a press into the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// Released → pressed edge, the count went up
    Counted,
    /// Key was already down (OS auto-repeat)
    Repeat,
    /// Not configured and not covered by track-all
    Untracked,
}

/// Tracked keys by extended code
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: BTreeMap<ExtendedCode, KeyState>,
    track_all: TrackAll,
    modifier_tracking: bool,
}

impl KeyRegistry {
    pub fn new(track_all: TrackAll, modifier_tracking: bool) -> Self {
        Self {
            keys: BTreeMap::new(),
            track_all,
            modifier_tracking,
        }
    }

    pub fn from_entries(entries: &[KeyEntry], track_all: TrackAll, modifier_tracking: bool) -> Self {
        Self::new(track_all, modifier_tracking).rebuild(entries, track_all, modifier_tracking)
    }

    /// Derives a registry for a new configuration.
    ///
    /// Configured keys keep the count and edge state of their previous
    /// incarnation. Dynamically tracked keys survive only while the new
    /// configuration still tracks all keys of their device class.
    pub fn rebuild(
        &self,
        entries: &[KeyEntry],
        track_all: TrackAll,
        modifier_tracking: bool,
    ) -> KeyRegistry {
        let mut next = KeyRegistry::new(track_all, modifier_tracking);

        for entry in entries {
            let mut state = KeyState::new(entry.code, entry.name.clone()).with_visibility(entry.visible);
            if let Some(previous) = self.keys.get(&entry.code) {
                state.carry_over(previous);
            }
            next.keys.insert(entry.code, state);
        }

        for (code, state) in &self.keys {
            if !next.keys.contains_key(code) && track_all.covers(*code) {
                next.keys.insert(*code, state.clone());
            }
        }

        debug!(
            "Rebuilt key registry: {} configured, {} total",
            entries.len(),
            next.keys.len()
        );
        next
    }

    pub fn track_all(&self) -> TrackAll {
        self.track_all
    }

    pub fn modifier_tracking(&self) -> bool {
        self.modifier_tracking
    }

    pub fn get(&self, code: ExtendedCode) -> Option<&KeyState> {
        self.keys.get(&code)
    }

    pub fn get_mut(&mut self, code: ExtendedCode) -> Option<&mut KeyState> {
        self.keys.get_mut(&code)
    }

    pub fn insert(&mut self, state: KeyState) -> Option<KeyState> {
        self.keys.insert(state.code(), state)
    }

    /// Removes a key outright; absent codes are a no-op
    pub fn remove(&mut self, code: ExtendedCode) -> Option<KeyState> {
        let removed = self.keys.remove(&code);
        if removed.is_some() {
            info!("Removed tracked key {}", code);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyState> {
        self.keys.values()
    }

    pub fn on_press(&mut self, code: ExtendedCode) -> PressOutcome {
        if !self.keys.contains_key(&code) {
            if !self.track_all.covers(code) {
                return PressOutcome::Untracked;
            }
            debug!("Tracking new key {} on first press", code);
            self.keys.insert(code, KeyState::new(code, code.to_string()));
        }

        let Some(state) = self.keys.get_mut(&code) else {
            return PressOutcome::Untracked;
        };
        if !state.press() {
            return PressOutcome::Repeat;
        }

        // A chord press re-arms the bare modifier keys it was built from.
        // Bare modifiers carry their own bit and must stay down.
        if self.modifier_tracking && code.modifier_key().is_none() {
            let modifiers = code.modifiers();
            if modifiers.alt {
                self.release_one(ExtendedCode::ALT);
            }
            if modifiers.ctrl {
                self.release_one(ExtendedCode::CTRL);
            }
            if modifiers.shift {
                self.release_one(ExtendedCode::RSHIFT);
                self.release_one(ExtendedCode::LSHIFT);
            }
        }
        PressOutcome::Counted
    }

    /// Releases `code` and returns how many keys went from down to up.
    ///
    /// With modifier tracking, releasing a bare modifier also releases every
    /// key pressed with that modifier held, and any release also releases all
    /// keys that share the same base raw code.
    pub fn on_release(&mut self, code: ExtendedCode) -> usize {
        if !self.modifier_tracking {
            return usize::from(self.release_one(code));
        }

        let mut released = 0;
        if let Some(modifier) = code.modifier_key() {
            for state in self.keys.values_mut() {
                let held = state.modifiers_at_press();
                let chorded = match modifier {
                    ModifierKey::Ctrl => held.ctrl,
                    ModifierKey::Alt => held.alt,
                    ModifierKey::Shift => held.shift,
                };
                if chorded && state.release() {
                    released += 1;
                }
            }
        }

        // NOTE: this also releases unrelated bindings sharing the base code
        let base = code.base();
        for (other, state) in self.keys.iter_mut() {
            if other.base() == base && state.release() {
                released += 1;
            }
        }
        released
    }

    fn release_one(&mut self, code: ExtendedCode) -> bool {
        self.keys
            .get_mut(&code)
            .map(KeyState::release)
            .unwrap_or(false)
    }

    /// Zeroes every per-key count
    pub fn reset_totals(&mut self) {
        for state in self.keys.values_mut() {
            state.set_count(0);
        }
    }

    pub fn counts(&self) -> Vec<KeyCount> {
        self.keys.values().map(KeyState::to_count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{normalize, DeviceClass, Modifiers, VC_CONTROL};

    fn entry(code: ExtendedCode, name: &str) -> KeyEntry {
        KeyEntry {
            name: name.to_string(),
            code,
            visible: true,
        }
    }

    fn ctrl_chord(raw: u32) -> ExtendedCode {
        normalize(raw, DeviceClass::Keyboard, true, Modifiers::ctrl())
    }

    const A: ExtendedCode = ExtendedCode::from_raw(0x1E);
    const B: ExtendedCode = ExtendedCode::from_raw(0x30);

    #[test]
    fn consecutive_presses_count_once() {
        let mut registry = KeyRegistry::from_entries(&[entry(A, "A")], TrackAll::default(), false);
        assert_eq!(registry.on_press(A), PressOutcome::Counted);
        for _ in 0..10 {
            assert_eq!(registry.on_press(A), PressOutcome::Repeat);
        }
        assert_eq!(registry.get(A).map(KeyState::count), Some(1));
    }

    #[test]
    fn untracked_keys_are_ignored_unless_tracking_all() {
        let mut registry = KeyRegistry::new(TrackAll::default(), false);
        assert_eq!(registry.on_press(A), PressOutcome::Untracked);
        assert_eq!(registry.on_release(A), 0);
        assert!(registry.is_empty());

        let mut registry = KeyRegistry::new(
            TrackAll {
                keys: true,
                buttons: false,
            },
            false,
        );
        assert_eq!(registry.on_press(A), PressOutcome::Counted);
        let button = ExtendedCode::from_raw(-1);
        assert_eq!(registry.on_press(button), PressOutcome::Untracked);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn releasing_ctrl_releases_all_ctrl_chords() {
        let chords = [ctrl_chord(0x1E), ctrl_chord(0x30), ctrl_chord(0x2E)];
        let mut entries: Vec<KeyEntry> = chords.iter().map(|c| entry(*c, "chord")).collect();
        entries.push(entry(ExtendedCode::CTRL, "Ctrl"));
        let mut registry = KeyRegistry::from_entries(&entries, TrackAll::default(), true);

        for chord in chords {
            assert_eq!(registry.on_press(chord), PressOutcome::Counted);
        }
        let ctrl = normalize(VC_CONTROL, DeviceClass::Keyboard, true, Modifiers::ctrl());
        assert_eq!(registry.on_release(ctrl), 3);
        assert!(chords
            .iter()
            .all(|c| registry.get(*c).is_some_and(|k| !k.is_down())));
    }

    #[test]
    fn releasing_ctrl_without_tracking_only_releases_ctrl() {
        let plain_ctrl = normalize(VC_CONTROL, DeviceClass::Keyboard, false, Modifiers::NONE);
        let chords = [ctrl_chord(0x1E), ctrl_chord(0x30)];
        let mut entries: Vec<KeyEntry> = chords.iter().map(|c| entry(*c, "chord")).collect();
        entries.push(entry(plain_ctrl, "Ctrl"));
        let mut registry = KeyRegistry::from_entries(&entries, TrackAll::default(), false);

        registry.on_press(plain_ctrl);
        for chord in chords {
            registry.on_press(chord);
        }
        assert_eq!(registry.on_release(plain_ctrl), 1);
        assert!(chords
            .iter()
            .all(|c| registry.get(*c).is_some_and(KeyState::is_down)));
    }

    #[test]
    fn release_matches_base_code_with_tracking() {
        let chord = ctrl_chord(0x1E);
        let mut registry =
            KeyRegistry::from_entries(&[entry(chord, "Ctrl+A"), entry(A, "A")], TrackAll::default(), true);
        registry.on_press(chord);
        // Ctrl already released, so the key comes back without the modifier bit
        assert_eq!(registry.on_release(A), 1);
        assert!(!registry.get(chord).is_some_and(KeyState::is_down));
    }

    #[test]
    fn chord_press_rearms_bare_modifier() {
        let chord = ctrl_chord(0x1E);
        let mut registry = KeyRegistry::from_entries(
            &[entry(ExtendedCode::CTRL, "Ctrl"), entry(chord, "Ctrl+A")],
            TrackAll::default(),
            true,
        );
        assert_eq!(registry.on_press(ExtendedCode::CTRL), PressOutcome::Counted);
        assert_eq!(registry.on_press(chord), PressOutcome::Counted);
        assert!(!registry.get(ExtendedCode::CTRL).is_some_and(KeyState::is_down));
    }

    #[test]
    fn held_bare_modifiers_count_once() {
        let mut registry = KeyRegistry::from_entries(
            &[
                entry(ExtendedCode::CTRL, "Ctrl"),
                entry(ExtendedCode::ALT, "Alt"),
                entry(ExtendedCode::LSHIFT, "LShift"),
                entry(ExtendedCode::RSHIFT, "RShift"),
            ],
            TrackAll::default(),
            true,
        );
        for modifier in [
            ExtendedCode::CTRL,
            ExtendedCode::ALT,
            ExtendedCode::LSHIFT,
            ExtendedCode::RSHIFT,
        ] {
            assert_eq!(registry.on_press(modifier), PressOutcome::Counted);
            for _ in 0..4 {
                assert_eq!(registry.on_press(modifier), PressOutcome::Repeat);
            }
            assert_eq!(registry.get(modifier).map(KeyState::count), Some(1));
            assert!(registry.get(modifier).is_some_and(KeyState::is_down));
        }
    }

    #[test]
    fn rebuild_preserves_counts_of_unchanged_keys() {
        let mut registry = KeyRegistry::from_entries(
            &[entry(A, "A"), entry(B, "B")],
            TrackAll {
                keys: true,
                buttons: false,
            },
            false,
        );
        let dynamic = ExtendedCode::from_raw(0x2E);
        for code in [A, B, dynamic] {
            registry.on_press(code);
            registry.on_release(code);
        }
        registry.on_press(A);

        let next = registry.rebuild(&[entry(A, "Renamed")], TrackAll::default(), false);
        assert_eq!(next.len(), 1);
        let a = next.get(A).expect("A kept");
        assert_eq!(a.count(), 2);
        assert!(a.is_down());
        assert_eq!(a.name(), "Renamed");
        assert!(next.get(B).is_none());
        assert!(next.get(dynamic).is_none());

        let kept = registry.rebuild(
            &[],
            TrackAll {
                keys: true,
                buttons: false,
            },
            false,
        );
        assert_eq!(kept.get(dynamic).map(KeyState::count), Some(1));
    }

    #[test]
    fn remove_and_reset_totals() {
        let mut registry = KeyRegistry::from_entries(&[entry(A, "A"), entry(B, "B")], TrackAll::default(), false);
        registry.on_press(A);
        registry.on_press(B);
        assert!(registry.remove(B).is_some());
        assert!(registry.remove(B).is_none());

        registry.reset_totals();
        assert_eq!(registry.get(A).map(KeyState::count), Some(0));
        assert_eq!(registry.counts().len(), 1);
    }
}
