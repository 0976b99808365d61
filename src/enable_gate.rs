/* Copyright 2024 The zeroexportd Authors
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Latched on/off signal gating actuation without interrupting sampling or
//! telemetry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct EnableGate {
    state: Arc<AtomicBool>,
}

impl EnableGate {
    /// Initially OFF.
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.state.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.state.store(false, Ordering::SeqCst);
    }

    pub fn toggle(&self) -> bool {
        let new = !self.is_enabled();
        self.state.store(new, Ordering::SeqCst);
        new
    }

    /// Applies a bus command payload: `1`/`true`/`on` sets, `0`/`false`/`off`
    /// clears, case-insensitively and trimmed. Unrecognised payloads are
    /// ignored.
    pub fn apply_command(&self, payload: &str) {
        match payload.trim().to_lowercase().as_str() {
            "1" | "true" | "on" => self.set(),
            "0" | "false" | "off" => self.clear(),
            _ => {}
        }
    }
}

impl Default for EnableGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_off() {
        let gate = EnableGate::new();
        assert!(!gate.is_enabled());
    }

    #[test]
    fn apply_command_variants() {
        let gate = EnableGate::new();
        gate.apply_command(" ON ");
        assert!(gate.is_enabled());
        gate.apply_command("0");
        assert!(!gate.is_enabled());
        gate.apply_command("True");
        assert!(gate.is_enabled());
        gate.apply_command("off");
        assert!(!gate.is_enabled());
        gate.apply_command("garbage");
        assert!(!gate.is_enabled());
    }

    #[test]
    fn toggle_flips_state() {
        let gate = EnableGate::new();
        assert!(gate.toggle());
        assert!(!gate.toggle());
    }
}
