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

//! Pure feedback controller converting grid-power samples into aggregate
//! inverter power-limit setpoints.

use std::time::Instant;

use crate::config::ControlParams;

/// Mutable regulator state, reset only on explicit request.
pub struct RegulatorState {
    pub last_setpoint_w: i64,
    pub prev_time: Instant,
}

impl RegulatorState {
    fn new() -> Self {
        Self {
            last_setpoint_w: 0,
            prev_time: Instant::now(),
        }
    }
}

pub struct Regulator {
    params: ControlParams,
    state: RegulatorState,
}

fn clamp(value: i64, floor: i64, ceiling: i64) -> i64 {
    value.max(floor).min(ceiling)
}

impl Regulator {
    pub fn new(params: ControlParams) -> Self {
        params.validate();
        Self {
            params,
            state: RegulatorState::new(),
        }
    }

    pub fn last_setpoint_w(&self) -> i64 {
        self.state.last_setpoint_w
    }

    /// Zeroes last-setpoint and refreshes the monotonic timestamp.
    pub fn reset(&mut self) {
        self.state.last_setpoint_w = 0;
        self.state.prev_time = Instant::now();
    }

    /// `compute(grid_w, ceiling_w, floor_w, inverter_w?) -> setpoint_w`.
    ///
    /// Deterministic for fixed state and inputs; mutates internal state on
    /// every non-dead-band call; never blocks, never fails.
    pub fn compute(
        &mut self,
        grid_w: f64,
        ceiling_w: i64,
        floor_w: i64,
        inverter_w: Option<f64>,
    ) -> i64 {
        self.state.prev_time = Instant::now();

        let p = &self.params;
        let error = grid_w - p.target_w as f64;

        // Saturation handling: if the inverters can't reach the commanded
        // limit, rebase the anchor only when we're trying to reduce power.
        let mut last_setpoint = self.state.last_setpoint_w;
        if let Some(inverter_w) = inverter_w {
            if inverter_w < 0.85 * last_setpoint as f64 && error < 0.0 {
                last_setpoint = inverter_w as i64;
            }
        }

        // 1. Dead band.
        if error.abs() <= p.tolerance_w as f64 {
            return self.state.last_setpoint_w;
        }

        // 2. Fast import spike.
        if grid_w > p.max_point_w as f64 {
            let jump_target = if p.on_grid_jump_percent > 0 {
                (ceiling_w * p.on_grid_jump_percent as i64) / 100
            } else {
                0
            };
            let candidate = jump_target.max(last_setpoint + error.floor() as i64);
            let setpoint = clamp(candidate, floor_w, ceiling_w);
            self.state.last_setpoint_w = setpoint;
            return setpoint;
        }

        // 3. Fast export cut.
        if grid_w < p.min_point_w as f64 && p.fast_limit_decrease {
            let candidate = last_setpoint + error.floor() as i64;
            let setpoint = clamp(candidate, floor_w, ceiling_w);
            self.state.last_setpoint_w = setpoint;
            return setpoint;
        }

        // 4. Tracked integral regulation with slow-descent dampening.
        let mut new_setpoint = last_setpoint + error.floor() as i64;
        if error < 0.0 {
            let slow_limit_w = (ceiling_w * p.slow_approx_limit_percent as i64) / 100;
            let delta = (last_setpoint - new_setpoint).abs();
            if delta > slow_limit_w {
                let dampener = (delta * p.slow_approx_factor_percent as i64) / 100;
                new_setpoint += dampener;
            }
        }
        let setpoint = clamp(new_setpoint, floor_w, ceiling_w);
        self.state.last_setpoint_w = setpoint;
        setpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> ControlParams {
        ControlParams {
            target_w: 20,
            tolerance_w: 10,
            max_point_w: 5000,
            min_point_w: -5000,
            on_grid_jump_percent: 20,
            fast_limit_decrease: true,
            slow_approx_limit_percent: 10,
            slow_approx_factor_percent: 50,
            outer_tick_s: 30,
            inner_poll_s: 5,
            ack_timeout_s: 5,
        }
    }

    fn regulator_at(last_setpoint: i64) -> Regulator {
        let mut reg = Regulator::new(params());
        reg.state.last_setpoint_w = last_setpoint;
        reg
    }

    // Two inverters, nameplate == device ceiling == 1000W each, floor 0.
    const CEILING: i64 = 2000;
    const FLOOR: i64 = 0;

    #[test]
    fn scenario_1_dead_band() {
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(25.0, CEILING, FLOOR, Some(1000.0)), 1000);
    }

    #[test]
    fn scenario_2_normal_climb() {
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(500.0, CEILING, FLOOR, Some(1000.0)), 1480);
    }

    #[test]
    fn scenario_3_descent_no_dampening() {
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(-100.0, CEILING, FLOOR, Some(1000.0)), 880);
    }

    #[test]
    fn scenario_4_dampened_descent() {
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(-500.0, CEILING, FLOOR, Some(1000.0)), 740);
    }

    #[test]
    fn scenario_5_saturated_export_rebase() {
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(-100.0, CEILING, FLOOR, Some(200.0)), 80);
    }

    #[test]
    fn scenario_6_fast_cut() {
        let mut reg = regulator_at(2000);
        assert_eq!(reg.compute(-6000.0, CEILING, FLOOR, Some(2000.0)), 0);
    }

    #[test]
    fn dead_band_leaves_state_untouched() {
        let mut reg = regulator_at(500);
        let before = reg.last_setpoint_w();
        let out = reg.compute(25.0, CEILING, FLOOR, None);
        assert_eq!(out, 500);
        assert_eq!(reg.last_setpoint_w(), before);
    }

    #[test]
    fn saturation_import_anchors_on_last_setpoint() {
        // P < 0.85*last but error > 0: anchor stays at last-setpoint.
        let mut reg = regulator_at(1000);
        assert_eq!(reg.compute(500.0, CEILING, FLOOR, Some(200.0)), 1480);
    }

    #[test]
    fn reset_zeroes_state() {
        let mut reg = regulator_at(1234);
        reg.reset();
        assert_eq!(reg.last_setpoint_w(), 0);
    }

    proptest! {
        #[test]
        fn clamping_holds_for_arbitrary_inputs(
            grid in -20000.0f64..20000.0,
            floor in 0i64..2000,
            extra in 0i64..8000,
            last in 0i64..10000,
            inv_power in proptest::option::of(-1000.0f64..10000.0),
        ) {
            let ceiling = floor + extra;
            let mut reg = regulator_at(last.min(ceiling).max(floor));
            let out = reg.compute(grid, ceiling, floor, inv_power);
            prop_assert!(out >= floor && out <= ceiling);
        }

        #[test]
        fn fast_cut_is_monotone_non_increasing(
            last in 0i64..10000,
            grid in -20000.0f64..-5001.0,
        ) {
            let mut params = params();
            params.fast_limit_decrease = true;
            let mut reg = Regulator::new(params);
            reg.state.last_setpoint_w = last;
            let out = reg.compute(grid, last.max(1), 0, Some(last as f64));
            prop_assert!(out <= last);
        }

        #[test]
        fn fast_spike_is_monotone_non_decreasing(
            last in 0i64..10000,
            grid in 5001.0f64..20000.0,
        ) {
            let mut reg = Regulator::new(params());
            reg.state.last_setpoint_w = last;
            let ceiling = (last + 10000).max(1);
            let out = reg.compute(grid, ceiling, 0, Some(last as f64));
            prop_assert!(out >= last);
        }
    }
}
