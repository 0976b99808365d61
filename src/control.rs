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

//! The control loop: on a fixed outer tick, rebuilds the active inverter
//! set, samples the meter, runs the regulator and apportioner, and
//! dispatches limits; between outer ticks it runs a bounded inner fast-poll
//! loop watching only grid power for a transient spike or export emergency.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::apportioner::{apportion, ActiveInverter};
use crate::config::{Config, InverterSpec};
use crate::enable_gate::EnableGate;
use crate::gateway::{GatewayActuator, GatewayView};
use crate::meter::MeterReader;
use crate::regulator::Regulator;
use crate::telemetry::TelemetrySink;

pub struct ControlLoop {
    inverters: BTreeMap<String, InverterSpec>,
    view: Arc<GatewayView>,
    actuator: GatewayActuator,
    meter: Box<dyn MeterReader>,
    gate: EnableGate,
    regulator: Regulator,
    telemetry: Arc<dyn TelemetrySink>,
    outer_tick: Duration,
    inner_poll: Duration,
    ack_timeout: Duration,
}

impl ControlLoop {
    pub fn new(
        config: &Config,
        view: Arc<GatewayView>,
        actuator: GatewayActuator,
        meter: Box<dyn MeterReader>,
        gate: EnableGate,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            inverters: crate::config::inverters_by_serial(config),
            view,
            actuator,
            meter,
            gate,
            regulator: Regulator::new(config.control),
            telemetry,
            outer_tick: Duration::from_secs(config.control.outer_tick_s),
            inner_poll: Duration::from_secs(config.control.inner_poll_s),
            ack_timeout: Duration::from_secs(config.control.ack_timeout_s),
        }
    }

    /// Rebuilds the active set, skipping disabled or unreachable
    /// inverters.
    fn active_set(&self) -> Vec<ActiveInverter> {
        self.inverters
            .values()
            .filter(|spec| spec.enabled && self.view.reachable(&spec.serial))
            .map(ActiveInverter::from_spec)
            .collect()
    }

    /// Emits telemetry for the meter reading, gateway health, and every
    /// active inverter's power/temperature/limit/panel channels.
    fn record_telemetry(&self, grid_w: f64, active: &[ActiveInverter]) {
        self.telemetry.record(
            "grid",
            &[("power_w", grid_w)],
            &[],
        );
        self.telemetry.record(
            "gateway",
            &[],
            &[("status", &self.view.dtu_status())],
        );
        for inv in active {
            let name = self.view.name(&inv.serial);
            self.telemetry.record(
                "inverter",
                &[
                    ("power_w", self.view.power(&inv.serial)),
                    ("temperature_c", self.view.temperature(&inv.serial)),
                    ("limit_applied_w", self.view.limit_applied(&inv.serial)),
                    ("limit_relative_pct", self.view.limit_relative(&inv.serial)),
                ],
                &[("serial", &inv.serial), ("name", &name)],
            );
            for (channel, voltage) in self.view.panel_voltages(&inv.serial).iter().enumerate() {
                self.telemetry.record(
                    "panel",
                    &[("voltage_v", *voltage)],
                    &[("serial", &inv.serial), ("channel", &channel.to_string())],
                );
            }
        }
    }

    async fn publish_enabled_state(&self, enabled: bool) {
        if let Err(err) = self.actuator.publish_state("enabled", enabled).await {
            warn!("failed to publish enabled state: {err}");
        }
    }

    /// Dispatches one apportioned share to each active inverter, publishes
    /// our own aggregate state topics, and kicks off an ack check for each
    /// inverter on a detached task so a slow-to-apply gateway never delays
    /// the next poll.
    async fn dispatch(&self, aggregate_w: i64, grid_w: f64, active: &[ActiveInverter]) {
        let shares = apportion(aggregate_w, active);
        for inv in active {
            if let Some(&share_w) = shares.get(&inv.serial) {
                if let Err(err) = self.actuator.set_limit(&inv.serial, share_w).await {
                    warn!("inverter {}: failed to set limit: {err}", inv.serial);
                }
                self.spawn_ack_check(inv, share_w);
            }
        }
        if let Err(err) = self.actuator.publish_state("limit", aggregate_w).await {
            warn!("failed to publish limit state: {err}");
        }
        if let Err(err) = self.actuator.publish_state("grid_power", grid_w).await {
            warn!("failed to publish grid_power state: {err}");
        }
        self.publish_enabled_state(true).await;
    }

    /// Polls for the gateway to apply `share_w` on `inv`, off the hot path.
    fn spawn_ack_check(&self, inv: &ActiveInverter, share_w: i64) {
        let view = self.view.clone();
        let actuator = self.actuator.clone();
        let serial = inv.serial.clone();
        let device_ceiling_w = inv.device_ceiling_w;
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            actuator
                .wait_for_ack(&view, &serial, share_w, device_ceiling_w, timeout)
                .await;
        });
    }

    /// Runs the inner fast-poll countdown between outer ticks: re-reads
    /// grid power only, and re-dispatches early on a transient spike or
    /// export emergency.
    async fn inner_poll_loop(
        &mut self,
        active: &[ActiveInverter],
        ceiling_w: i64,
        floor_w: i64,
        token: &CancellationToken,
    ) {
        let remaining = self.outer_tick.as_secs() / self.inner_poll.as_secs().max(1);
        let mut ticker = tokio::time::interval(self.inner_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        for _ in 1..remaining {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => return,
            }
            let reading = match self.meter.read().await {
                Ok(reading) => reading,
                Err(err) => {
                    warn!("inner poll: meter read failed: {err}");
                    continue;
                }
            };
            let inverter_w = Some(active.iter().map(|inv| self.view.power(&inv.serial)).sum());
            let prev_setpoint = self.regulator.last_setpoint_w();
            let setpoint = self
                .regulator
                .compute(reading.power_w, ceiling_w, floor_w, inverter_w);
            // The regulator leaves last_setpoint_w unchanged inside the dead
            // band; only a fast spike/cut branch moves it between outer
            // ticks, and that's the only case the inner loop acts on.
            if setpoint != prev_setpoint {
                self.dispatch(setpoint, reading.power_w, active).await;
            }
        }
    }

    /// Runs until `token` is cancelled. Waits out a 3-second settle delay
    /// first so the gateway connection and the first meter reading have a
    /// moment to come up before the loop starts acting on them.
    pub async fn run(mut self, token: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3)) => {}
            _ = token.cancelled() => return,
        }
        info!("control loop starting");

        let mut ticker = tokio::time::interval(self.outer_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => {
                    info!("control loop shutting down");
                    return;
                }
            }

            // Rebuild the active set.
            let active = self.active_set();

            // Sample the meter.
            let reading = match self.meter.read().await {
                Ok(reading) => reading,
                Err(err) => {
                    warn!("meter read failed: {err}");
                    continue;
                }
            };

            self.record_telemetry(reading.power_w, &active);

            // Paused: publish state and wait for the next tick.
            if !self.gate.is_enabled() {
                self.publish_enabled_state(false).await;
                continue;
            }

            // Degraded: nothing to actuate.
            if active.is_empty() {
                warn!("no active inverters, skipping regulation this tick");
                continue;
            }

            let ceiling_w: i64 = active.iter().map(|inv| inv.device_ceiling_w).sum();
            let floor_w: i64 = active.iter().map(|inv| inv.floor_w).sum();
            let current_w: f64 = active.iter().map(|inv| self.view.power(&inv.serial)).sum();
            let setpoint = self
                .regulator
                .compute(reading.power_w, ceiling_w, floor_w, Some(current_w));

            self.dispatch(setpoint, reading.power_w, &active).await;

            // Fast-poll countdown until the next outer tick.
            self.inner_poll_loop(&active, ceiling_w, floor_w, &token).await;
        }
    }
}
