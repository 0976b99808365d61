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

//! The message bus worker: subscribes to gateway telemetry and our own
//! enable-command topic, dispatches inbound messages to the `GatewayView`
//! and `EnableGate`, and drains outbound commands queued by the
//! `GatewayActuator`.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::enable_gate::EnableGate;
use crate::gateway::{BusCommand, GatewayView};

fn qos_from(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub struct MqttBus {
    config: MqttConfig,
    view: Arc<GatewayView>,
    gate: EnableGate,
    outbound: mpsc::Receiver<BusCommand>,
}

impl MqttBus {
    pub fn new(
        config: MqttConfig,
        view: Arc<GatewayView>,
        gate: EnableGate,
        outbound: mpsc::Receiver<BusCommand>,
    ) -> Self {
        Self {
            config,
            view,
            gate,
            outbound,
        }
    }

    /// Runs until `token` is cancelled, reconnecting with exponential
    /// backoff from 1s doubling to a 30s cap.
    pub async fn run(mut self, token: CancellationToken) {
        let mut retry_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(30);

        loop {
            if token.is_cancelled() {
                return;
            }

            let mut options = MqttOptions::new(
                self.config.client_id.clone(),
                self.config.broker.clone(),
                self.config.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            options.set_last_will(LastWill::new(
                format!("{}/status", self.config.our_prefix),
                "offline",
                QoS::AtLeastOnce,
                true,
            ));

            let (client, mut event_loop) = AsyncClient::new(options, 64);

            let our_prefix = self.config.our_prefix.clone();
            let gateway_prefix = self.config.gateway_prefix.clone();
            let enable_topic = format!("{our_prefix}/set/enabled");

            if client
                .subscribe(format!("{gateway_prefix}/#"), QoS::AtMostOnce)
                .await
                .is_err()
            {
                self.backoff(&mut retry_delay, max_delay).await;
                continue;
            }
            if client
                .subscribe(&enable_topic, QoS::AtMostOnce)
                .await
                .is_err()
            {
                self.backoff(&mut retry_delay, max_delay).await;
                continue;
            }
            let _ = client
                .publish(
                    format!("{our_prefix}/status"),
                    QoS::AtLeastOnce,
                    true,
                    "online",
                )
                .await;

            info!(
                "MQTT connected to {}:{}",
                self.config.broker, self.config.port
            );
            retry_delay = Duration::from_secs(1);

            let result = self
                .connected_loop(&client, &mut event_loop, &gateway_prefix, &enable_topic, &token)
                .await;

            if token.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => {}
                Err(err) => {
                    warn!("MQTT connection lost: {err} — retrying in {retry_delay:?}");
                }
            }
            self.backoff(&mut retry_delay, max_delay).await;
        }
    }

    async fn backoff(&self, retry_delay: &mut Duration, max_delay: Duration) {
        tokio::time::sleep(*retry_delay).await;
        *retry_delay = (*retry_delay * 2).min(max_delay);
    }

    async fn connected_loop(
        &mut self,
        client: &AsyncClient,
        event_loop: &mut rumqttc::EventLoop,
        gateway_prefix: &str,
        enable_topic: &str,
        token: &CancellationToken,
    ) -> Result<(), rumqttc::ConnectionError> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(BusCommand::Publish { topic, payload, qos, retain }) => {
                            if let Err(err) = client.publish(topic, qos_from(qos), retain, payload).await {
                                warn!("MQTT publish failed: {err}");
                            }
                        }
                        None => return Ok(()),
                    }
                }
                event = event_loop.poll() => {
                    match event? {
                        Event::Incoming(Packet::Publish(publish)) => {
                            let topic = publish.topic.clone();
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            if topic == enable_topic {
                                self.gate.apply_command(&payload);
                            } else if topic.starts_with(gateway_prefix) {
                                self.view.handle(&topic, &payload);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
