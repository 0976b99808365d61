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

//! The time-series telemetry sink: batches points and flushes them to
//! InfluxDB every few seconds, re-buffering on a failed write.

use std::sync::Mutex;

use async_trait::async_trait;
use influxdb2::api::write::TimestampPrecision;
use influxdb2::models::DataPoint;
use influxdb2::Client;
use log::{info, warn};

use crate::config::TelemetryConfig;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Buffers a measurement for the next flush. Never blocks on I/O.
    fn record(&self, measurement: &str, fields: &[(&str, f64)], tags: &[(&str, &str)]);

    /// Writes the buffered batch out, re-buffering on failure.
    async fn flush(&self);
}

pub struct InfluxTelemetry {
    client: Client,
    bucket: String,
    buffer: Mutex<Vec<DataPoint>>,
}

impl InfluxTelemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        let client = Client::new(&config.url, &config.org, &config.token);
        Self {
            client,
            bucket: config.bucket.clone(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub async fn check_health(&self) {
        match self.client.health().await {
            Ok(health) => {
                info!("telemetry sink health check: {:?}", health.status);
            }
            Err(err) => {
                warn!("could not reach telemetry sink: {err}");
            }
        }
    }
}

#[async_trait]
impl TelemetrySink for InfluxTelemetry {
    fn record(&self, measurement: &str, fields: &[(&str, f64)], tags: &[(&str, &str)]) {
        let mut builder = DataPoint::builder(measurement).timestamp(chrono::Utc::now().timestamp());
        for (key, value) in fields {
            builder = builder.field(*key, *value);
        }
        for (key, value) in tags {
            builder = builder.tag(*key, *value);
        }
        match builder.build() {
            Ok(point) => self.buffer.lock().unwrap().push(point),
            Err(err) => warn!("failed to build telemetry point {measurement}: {err}"),
        }
    }

    async fn flush(&self) {
        let batch: Vec<DataPoint> = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        let count = batch.len();
        let stream = futures::stream::iter(batch.clone());
        match self
            .client
            .write_with_precision(&self.bucket, stream, TimestampPrecision::Seconds)
            .await
        {
            Ok(()) => {
                info!("flushed {count} telemetry points");
            }
            Err(err) => {
                warn!("telemetry write failed, re-buffering {count} points: {err}");
                let mut buffer = self.buffer.lock().unwrap();
                let mut restored = batch;
                restored.append(&mut buffer);
                *buffer = restored;
            }
        }
    }
}

/// Runs `sink.flush()` on a fixed cadence until `token` is cancelled, then
/// performs one final flush.
pub async fn flush_loop(
    sink: std::sync::Arc<dyn TelemetrySink>,
    interval: std::time::Duration,
    token: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => { sink.flush().await; }
            _ = token.cancelled() => {
                sink.flush().await;
                return;
            }
        }
    }
}

/// A sink that discards everything, used when telemetry isn't configured.
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySink for NullTelemetry {
    fn record(&self, _measurement: &str, _fields: &[(&str, f64)], _tags: &[(&str, &str)]) {}
    async fn flush(&self) {}
}
