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

//! Read-through cache of gateway telemetry (`GatewayView`) and the
//! publish-side actuator (`GatewayActuator`) that sends limit/power commands
//! back to the gateway over the message bus.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::mpsc;

/// Commands the actuator hands to the MQTT bus task for publishing, in the
/// order they were issued — the bus preserves per-client publish order.
#[derive(Debug, Clone)]
pub enum BusCommand {
    Publish {
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
    },
}

/// Concurrency-safe key/value cache of the latest payload received for each
/// gateway topic. Readers never block on I/O; staleness is intentionally
/// not tracked.
pub struct GatewayView {
    gateway_prefix: String,
    cache: Mutex<HashMap<String, String>>,
}

impl GatewayView {
    pub fn new(gateway_prefix: impl Into<String>) -> Self {
        Self {
            gateway_prefix: gateway_prefix.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Single write path, called from the MQTT bus task. Last-writer-wins
    /// per topic.
    pub fn handle(&self, topic: &str, payload: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(topic.to_string(), payload.to_string());
    }

    fn get(&self, topic: &str) -> Option<String> {
        self.cache.lock().unwrap().get(topic).cloned()
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.gateway_prefix, suffix)
    }

    pub fn reachable(&self, serial: &str) -> bool {
        self.get(&self.topic(&format!("{serial}/status/reachable")))
            .as_deref()
            == Some("1")
    }

    pub fn power(&self, serial: &str) -> f64 {
        self.get(&self.topic(&format!("{serial}/0/power")))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn temperature(&self, serial: &str) -> f64 {
        self.get(&self.topic(&format!("{serial}/0/temperature")))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn limit_applied(&self, serial: &str) -> f64 {
        self.get(&self.topic(&format!("{serial}/status/limit_absolute")))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn limit_relative(&self, serial: &str) -> f64 {
        self.get(&self.topic(&format!("{serial}/status/limit_relative")))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn name(&self, serial: &str) -> String {
        self.get(&self.topic(&format!("{serial}/name")))
            .unwrap_or_else(|| serial.to_string())
    }

    pub fn panel_voltages(&self, serial: &str) -> Vec<f64> {
        (1..=4)
            .filter_map(|ch| {
                let v: f64 = self
                    .get(&self.topic(&format!("{serial}/{ch}/voltage")))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                (v > 0.0).then_some(v)
            })
            .collect()
    }

    pub fn total_ac_power(&self) -> f64 {
        self.get(&self.topic("ac/power"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn dtu_status(&self) -> String {
        self.get(&self.topic("dtu/status")).unwrap_or_default()
    }
}

/// Sends limit/power commands to the gateway via the bus. Holds a channel
/// into the MQTT bus task rather than a client handle directly, since only
/// one task owns the publish path.
#[derive(Clone)]
pub struct GatewayActuator {
    gateway_prefix: String,
    our_prefix: String,
    tx: mpsc::Sender<BusCommand>,
}

impl GatewayActuator {
    pub fn new(
        gateway_prefix: impl Into<String>,
        our_prefix: impl Into<String>,
        tx: mpsc::Sender<BusCommand>,
    ) -> Self {
        Self {
            gateway_prefix: gateway_prefix.into(),
            our_prefix: our_prefix.into(),
            tx,
        }
    }

    /// Publishes one of our own retained, QoS-1 state topics
    /// (`<our_prefix>/state/<key>`), e.g. `limit`, `grid_power`, `enabled`.
    pub async fn publish_state(&self, key: &str, value: impl std::fmt::Display) -> Result<(), std::io::Error> {
        let topic = format!("{}/state/{key}", self.our_prefix);
        self.publish(topic, value.to_string(), 1, true).await
    }

    /// Publishes an absolute, non-persistent limit command.
    pub async fn set_limit(&self, serial: &str, watts: i64) -> Result<(), std::io::Error> {
        let topic = format!(
            "{}/{serial}/cmd/limit_nonpersistent_absolute",
            self.gateway_prefix
        );
        self.publish(topic, watts.to_string(), 0, false).await
    }

    /// Publishes an on/off command.
    pub async fn set_power(&self, serial: &str, on: bool) -> Result<(), std::io::Error> {
        let topic = format!("{}/{serial}/cmd/power", self.gateway_prefix);
        self.publish(topic, if on { "1" } else { "0" }.to_string(), 0, false)
            .await
    }

    async fn publish(
        &self,
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
    ) -> Result<(), std::io::Error> {
        self.tx
            .send(BusCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            })
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::BrokenPipe, err))
    }

    /// Polls `limit_applied` every 500ms until the applied limit is within
    /// 5% of the device ceiling of the target, or `timeout` elapses.
    /// Advisory only — the control loop never stalls the hot path on this.
    pub async fn wait_for_ack(
        &self,
        view: &GatewayView,
        serial: &str,
        target_w: i64,
        device_ceiling_w: i64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let margin = 0.05 * device_ceiling_w as f64;
        loop {
            let applied = view.limit_applied(serial);
            if (applied - target_w as f64).abs() <= margin {
                info!("inverter {serial}: limit {target_w}W acknowledged");
                return true;
            }
            if Instant::now() >= deadline {
                warn!("inverter {serial}: limit ack timeout");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
