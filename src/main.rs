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

mod apportioner;
mod config;
mod control;
mod enable_gate;
mod gateway;
mod http;
mod meter;
mod mqtt;
mod regulator;
mod telemetry;

use std::sync::Arc;

use clap::Parser;
use log::info;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::load_config;
use control::ControlLoop;
use enable_gate::EnableGate;
use gateway::{GatewayActuator, GatewayView};
use meter::HttpMeter;
use mqtt::MqttBus;
use telemetry::{flush_loop, InfluxTelemetry, TelemetrySink};

#[derive(Parser, Debug)]
#[command(version, about = "Regulates grid-tied microinverter output to hold net grid power near a setpoint")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "zeroexportd.toml")]
    config: String,
}

/// Waits for either SIGTERM or SIGINT, then cancels `token` to unwind every
/// task.
async fn wait_for_shutdown(token: CancellationToken) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
    token.cancel();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let token = CancellationToken::new();

    let view = Arc::new(GatewayView::new(config.mqtt.gateway_prefix.clone()));
    let gate = EnableGate::new();
    let (bus_tx, bus_rx) = mpsc::channel(256);

    let actuator = GatewayActuator::new(
        config.mqtt.gateway_prefix.clone(),
        config.mqtt.our_prefix.clone(),
        bus_tx,
    );
    let meter = Box::new(HttpMeter::new(&config.meter)?);
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(InfluxTelemetry::new(&config.telemetry));

    let mqtt_bus = MqttBus::new(config.mqtt.clone(), view.clone(), gate.clone(), bus_rx);
    let control_loop = ControlLoop::new(&config, view, actuator, meter, gate.clone(), telemetry.clone());

    let mqtt_token = token.clone();
    let mqtt_handle = tokio::spawn(async move { mqtt_bus.run(mqtt_token).await });

    let control_token = token.clone();
    let control_handle = tokio::spawn(async move { control_loop.run(control_token).await });

    let http_token = token.clone();
    let http_bind = config.http.bind.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(&http_bind, gate, http_token).await {
            log::error!("HTTP toggle surface exited with an error: {err}");
        }
    });

    let flush_token = token.clone();
    let flush_handle = tokio::spawn(flush_loop(
        telemetry,
        std::time::Duration::from_secs(config.telemetry.flush_interval_s),
        flush_token,
    ));

    wait_for_shutdown(token).await;

    let _ = tokio::join!(mqtt_handle, control_handle, http_handle, flush_handle);
    info!("shutdown complete");
    Ok(())
}
