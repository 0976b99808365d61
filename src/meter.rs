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

//! Polls the house's main power meter over HTTP and normalises the reading
//! to a signed grid-power float.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::{MeterConfig, MeterFamily};

/// A single poll of the grid meter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterReading {
    pub power_w: f64,
    pub voltage: f64,
    pub current: f64,
    pub power_factor: f64,
    pub reactive: f64,
    pub total_imported: f64,
    pub total_exported: f64,
}

#[async_trait]
pub trait MeterReader: Send + Sync {
    async fn read(&self) -> Result<MeterReading, std::io::Error>;
}

pub struct HttpMeter {
    client: Client,
    endpoint: String,
    family: MeterFamily,
    emeter_index: Option<u8>,
    user: Option<String>,
    password: Option<String>,
}

fn io_err(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

fn as_f64(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

impl HttpMeter {
    pub fn new(config: &MeterConfig) -> Result<Self, std::io::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(io_err)?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            family: config.family,
            emeter_index: config.emeter_index,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("http://{}{path}", self.endpoint);
        let req = self.client.get(url);
        match (&self.user, &self.password) {
            (Some(user), password) => req.basic_auth(user, password.clone()),
            _ => req,
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, std::io::Error> {
        self.request(path)
            .send()
            .await
            .map_err(io_err)?
            .error_for_status()
            .map_err(io_err)?
            .json()
            .await
            .map_err(io_err)
    }

    async fn read_single_phase_em(&self) -> Result<MeterReading, std::io::Error> {
        if let Some(index) = self.emeter_index {
            let data = self.get_json(&format!("/emeter/{index}")).await?;
            return Ok(MeterReading {
                power_w: as_f64(&data, "power"),
                voltage: as_f64(&data, "voltage"),
                current: as_f64(&data, "current"),
                power_factor: as_f64(&data, "pf"),
                reactive: as_f64(&data, "reactive"),
                total_imported: as_f64(&data, "total"),
                total_exported: as_f64(&data, "total_returned"),
            });
        }
        let data = self.get_json("/status").await?;
        let emeters = data.get("emeters").and_then(Value::as_array).cloned().unwrap_or_default();
        let power = emeters.iter().map(|e| as_f64(e, "power")).sum();
        let first = emeters.first().cloned().unwrap_or(Value::Null);
        Ok(MeterReading {
            power_w: power,
            voltage: as_f64(&first, "voltage"),
            current: as_f64(&first, "current"),
            power_factor: as_f64(&first, "pf"),
            reactive: as_f64(&first, "reactive"),
            total_imported: emeters.iter().map(|e| as_f64(e, "total")).sum(),
            total_exported: emeters.iter().map(|e| as_f64(e, "total_returned")).sum(),
        })
    }

    async fn read_three_phase_em(&self) -> Result<MeterReading, std::io::Error> {
        let data = self.get_json("/status").await?;
        let emeters = data.get("emeters").and_then(Value::as_array).cloned().unwrap_or_default();
        let first = emeters.first().cloned().unwrap_or(Value::Null);
        Ok(MeterReading {
            power_w: as_f64(&data, "total_power"),
            voltage: as_f64(&first, "voltage"),
            current: as_f64(&first, "current"),
            power_factor: as_f64(&first, "pf"),
            total_imported: emeters.iter().map(|e| as_f64(e, "total")).sum(),
            total_exported: emeters.iter().map(|e| as_f64(e, "total_returned")).sum(),
            ..Default::default()
        })
    }

    async fn read_three_phase_em_pro(&self) -> Result<MeterReading, std::io::Error> {
        let data = self.get_json("/rpc/EM.GetStatus?id=0").await?;
        Ok(MeterReading {
            power_w: as_f64(&data, "total_act_power"),
            voltage: as_f64(&data, "a_voltage"),
            current: as_f64(&data, "a_current"),
            power_factor: as_f64(&data, "a_pf"),
            total_imported: as_f64(&data, "total_act"),
            total_exported: as_f64(&data, "total_act_ret"),
            ..Default::default()
        })
    }

    async fn read_single_channel_relay_gen1(&self) -> Result<MeterReading, std::io::Error> {
        let data = self.get_json("/status").await?;
        let meter = data
            .get("meters")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(MeterReading {
            power_w: as_f64(&meter, "power"),
            total_imported: as_f64(&meter, "total"),
            ..Default::default()
        })
    }

    async fn read_plus_single_channel(&self) -> Result<MeterReading, std::io::Error> {
        let data = self.get_json("/rpc/Switch.GetStatus?id=0").await?;
        let total = data
            .get("aenergy")
            .map(|a| as_f64(a, "total"))
            .unwrap_or(0.0);
        Ok(MeterReading {
            power_w: as_f64(&data, "apower"),
            voltage: as_f64(&data, "voltage"),
            current: as_f64(&data, "current"),
            total_imported: total,
            ..Default::default()
        })
    }
}

#[async_trait]
impl MeterReader for HttpMeter {
    async fn read(&self) -> Result<MeterReading, std::io::Error> {
        match self.family {
            MeterFamily::SinglePhaseEm => self.read_single_phase_em().await,
            MeterFamily::ThreePhaseEm => self.read_three_phase_em().await,
            MeterFamily::ThreePhaseEmPro => self.read_three_phase_em_pro().await,
            MeterFamily::SingleChannelRelayGen1 => self.read_single_channel_relay_gen1().await,
            MeterFamily::PlusSingleChannel => self.read_plus_single_channel().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_f64_missing_key_defaults_to_zero() {
        let v = serde_json::json!({"power": 42.5});
        assert_eq!(as_f64(&v, "power"), 42.5);
        assert_eq!(as_f64(&v, "missing"), 0.0);
    }
}
