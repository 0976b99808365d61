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

//! Splits an aggregate setpoint across the currently reachable inverter set,
//! proportional to nameplate ceiling, clamped per-inverter and adjusted by
//! an optional calibration factor.

use std::collections::BTreeMap;

use crate::config::InverterSpec;

/// One entry of the control loop's rebuilt active set.
#[derive(Debug, Clone)]
pub struct ActiveInverter {
    pub serial: String,
    pub nameplate_ceiling_w: i64,
    pub device_ceiling_w: i64,
    pub floor_w: i64,
    pub calibration: f64,
}

impl ActiveInverter {
    pub fn from_spec(spec: &InverterSpec) -> Self {
        Self {
            serial: spec.serial.clone(),
            nameplate_ceiling_w: spec.nameplate_ceiling_w,
            device_ceiling_w: spec.device_ceiling_w,
            floor_w: spec.floor_w(),
            calibration: spec.calibration,
        }
    }
}

fn clamp(value: i64, floor: i64, ceiling: i64) -> i64 {
    value.max(floor).min(ceiling)
}

/// `apportion(aggregate_w, active[]) -> map<serial, share_w>`.
///
/// Pure and deterministic in input order. Callers must not invoke this with
/// an empty active set — the control loop skips the call and logs a
/// degraded-state warning instead.
pub fn apportion(aggregate_w: i64, active: &[ActiveInverter]) -> BTreeMap<String, i64> {
    let total_nameplate: i64 = active.iter().map(|inv| inv.nameplate_ceiling_w).sum();
    let mut shares = BTreeMap::new();
    if total_nameplate <= 0 {
        return shares;
    }
    for inv in active {
        let provisional = (aggregate_w * inv.nameplate_ceiling_w) / total_nameplate;
        let mut share = clamp(provisional, inv.floor_w, inv.device_ceiling_w);
        if inv.calibration != 1.0 {
            share = (share as f64 * inv.calibration) as i64;
            share = clamp(share, inv.floor_w, inv.device_ceiling_w);
        }
        shares.insert(inv.serial.clone(), share);
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inv(serial: &str, nameplate: i64, device: i64, floor: i64, calibration: f64) -> ActiveInverter {
        ActiveInverter {
            serial: serial.to_string(),
            nameplate_ceiling_w: nameplate,
            device_ceiling_w: device,
            floor_w: floor,
            calibration,
        }
    }

    #[test]
    fn two_equal_inverters_split_evenly() {
        let active = vec![
            inv("a", 1000, 1000, 0, 1.0),
            inv("b", 1000, 1000, 0, 1.0),
        ];
        let shares = apportion(1000, &active);
        assert_eq!(shares["a"], 500);
        assert_eq!(shares["b"], 500);
    }

    #[test]
    fn three_inverters_proportional_pre_clamp() {
        let active = vec![
            inv("a", 1000, 1000, 0, 1.0),
            inv("b", 1000, 1000, 0, 1.0),
            inv("c", 500, 500, 0, 1.0),
        ];
        let shares = apportion(1000, &active);
        assert_eq!(shares["a"], 400);
        assert_eq!(shares["b"], 400);
        assert_eq!(shares["c"], 200);
    }

    #[test]
    fn calibration_is_reclamped_to_device_ceiling() {
        let active = vec![inv("a", 1000, 1000, 0, 1.5)];
        let shares = apportion(1000, &active);
        // provisional 1000 * 1.5 = 1500, clamped back to device ceiling 1000.
        assert_eq!(shares["a"], 1000);
    }

    #[test]
    fn floor_is_respected_even_for_zero_aggregate() {
        let active = vec![inv("a", 1000, 1000, 100, 1.0)];
        let shares = apportion(0, &active);
        assert_eq!(shares["a"], 100);
    }

    proptest! {
        #[test]
        fn apportion_bounds_hold(
            aggregate in 0i64..5000,
            n1 in 1i64..2000,
            n2 in 1i64..2000,
            n3 in 1i64..2000,
        ) {
            let active = vec![
                inv("a", n1, n1, 0, 1.0),
                inv("b", n2, n2, 0, 1.0),
                inv("c", n3, n3, 0, 1.0),
            ];
            let shares = apportion(aggregate, &active);
            for inv in &active {
                let share = shares[&inv.serial];
                prop_assert!(share >= inv.floor_w && share <= inv.device_ceiling_w);
            }
        }

        #[test]
        fn apportion_sum_within_count_minus_one(
            aggregate in 0i64..5000,
            n1 in 100i64..2000,
            n2 in 100i64..2000,
        ) {
            // Large device ceilings avoid clamp interference with the sum check.
            let active = vec![
                inv("a", n1, 1_000_000, 0, 1.0),
                inv("b", n2, 1_000_000, 0, 1.0),
            ];
            let shares = apportion(aggregate, &active);
            let sum: i64 = shares.values().sum();
            prop_assert!((sum - aggregate).abs() <= (active.len() as i64 - 1));
        }
    }
}
