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

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: String,
    pub gateway_prefix: String,
    pub our_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeterFamily {
    SinglePhaseEm,
    ThreePhaseEm,
    ThreePhaseEmPro,
    SingleChannelRelayGen1,
    PlusSingleChannel,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    pub endpoint: String,
    pub family: MeterFamily,
    #[serde(default)]
    pub emeter_index: Option<u8>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,
}

fn default_flush_interval_s() -> u64 {
    5
}

/// Regulation parameters, immutable after load.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct ControlParams {
    pub target_w: i64,
    pub tolerance_w: i64,
    pub max_point_w: i64,
    pub min_point_w: i64,
    #[serde(default)]
    pub on_grid_jump_percent: u32,
    #[serde(default)]
    pub fast_limit_decrease: bool,
    #[serde(default = "default_slow_approx_percent")]
    pub slow_approx_limit_percent: u32,
    #[serde(default = "default_slow_approx_percent")]
    pub slow_approx_factor_percent: u32,
    #[serde(default = "default_outer_tick_s")]
    pub outer_tick_s: u64,
    #[serde(default = "default_inner_poll_s")]
    pub inner_poll_s: u64,
    #[serde(default = "default_ack_timeout_s")]
    pub ack_timeout_s: u64,
}

fn default_slow_approx_percent() -> u32 {
    50
}

fn default_outer_tick_s() -> u64 {
    30
}

fn default_inner_poll_s() -> u64 {
    5
}

fn default_ack_timeout_s() -> u64 {
    5
}

impl ControlParams {
    /// Validates the invariants the regulator relies on. Panics on
    /// violation — these are caught at startup, never at runtime.
    pub fn validate(&self) {
        assert!(self.tolerance_w >= 0, "tolerance_w must be >= 0");
        assert!(
            self.max_point_w > self.target_w,
            "max_point_w must exceed target_w"
        );
        assert!(
            self.min_point_w < self.target_w,
            "min_point_w must be below target_w"
        );
        assert!(
            self.on_grid_jump_percent <= 100,
            "on_grid_jump_percent must be 0..=100"
        );
        assert!(
            self.slow_approx_limit_percent <= 100,
            "slow_approx_limit_percent must be 0..=100"
        );
        assert!(
            self.slow_approx_factor_percent <= 100,
            "slow_approx_factor_percent must be 0..=100"
        );
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct InverterSpec {
    pub serial: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub nameplate_ceiling_w: i64,
    pub device_ceiling_w: i64,
    #[serde(default)]
    pub floor_percent: u32,
    #[serde(default = "default_calibration")]
    pub calibration: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_calibration() -> f64 {
    1.0
}

impl InverterSpec {
    /// Floor in watts: floor-percent of the device ceiling.
    pub fn floor_w(&self) -> i64 {
        (self.device_ceiling_w * self.floor_percent as i64) / 100
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub meter: MeterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub control: ControlParams,
    pub inverters: Vec<InverterSpec>,
    pub telemetry: TelemetryConfig,
}

/// Resolve `${VAR}` / `${VAR:-default}` references against the process
/// environment. Ported from the zero-export controller's Python config
/// loader, re-expressed without the string-index loop.
fn resolve_env_vars(value: &str) -> String {
    let mut result = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after[..end];
        let (key, default) = match token.split_once(":-") {
            Some((k, d)) => (k, d),
            None => (token, ""),
        };
        result.push_str(&std::env::var(key).unwrap_or_else(|_| default.to_string()));
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

fn walk_and_resolve(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::String(s) => toml::Value::String(resolve_env_vars(&s)),
        toml::Value::Array(arr) => {
            toml::Value::Array(arr.into_iter().map(walk_and_resolve).collect())
        }
        toml::Value::Table(table) => {
            let mut resolved = toml::map::Map::new();
            for (k, v) in table {
                resolved.insert(k, walk_and_resolve(v));
            }
            toml::Value::Table(resolved)
        }
        other => other,
    }
}

/// Load configuration from a TOML file, resolving environment references
/// before typed deserialization. A missing file is a fatal startup error.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, std::io::Error> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|err| {
        std::io::Error::new(
            err.kind(),
            format!("config not found at {}: {err}", path.display()),
        )
    })?;
    let value: toml::Value = raw
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let resolved = walk_and_resolve(value);
    let config: Config = resolved
        .try_into()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    config.control.validate();
    Ok(config)
}

/// A lookup table of inverters by serial, used by the control loop to find
/// configuration for a given active set entry.
pub fn inverters_by_serial(config: &Config) -> BTreeMap<String, InverterSpec> {
    config
        .inverters
        .iter()
        .cloned()
        .map(|inv| (inv.serial.clone(), inv))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_plain() {
        std::env::set_var("SOCIT_TEST_VAR", "123");
        assert_eq!(resolve_env_vars("val_${SOCIT_TEST_VAR}"), "val_123");
        assert_eq!(resolve_env_vars("val_${MISSING_XYZ:-default}"), "val_default");
        assert_eq!(resolve_env_vars("val_${MISSING_XYZ}"), "val_");
        assert_eq!(resolve_env_vars("no_var"), "no_var");
    }

    #[test]
    fn floor_w_rounds_down() {
        let inv = InverterSpec {
            serial: "1".into(),
            enabled: true,
            nameplate_ceiling_w: 1000,
            device_ceiling_w: 1200,
            floor_percent: 10,
            calibration: 1.0,
        };
        assert_eq!(inv.floor_w(), 120);
    }

    #[test]
    #[should_panic]
    fn validate_rejects_negative_tolerance() {
        let params = ControlParams {
            target_w: 0,
            tolerance_w: -1,
            max_point_w: 100,
            min_point_w: -100,
            on_grid_jump_percent: 0,
            fast_limit_decrease: false,
            slow_approx_limit_percent: 50,
            slow_approx_factor_percent: 50,
            outer_tick_s: 30,
            inner_poll_s: 5,
            ack_timeout_s: 5,
        };
        params.validate();
    }
}
