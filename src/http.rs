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

//! The HTTP toggle surface: `GET /api/toggle` flips the Enable Gate,
//! `GET /api/status` reads it.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Redirect};
use axum::routing::get;
use axum::Router;
use log::info;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::enable_gate::EnableGate;

#[derive(Debug, Serialize)]
struct ToggleResponse {
    enabled: &'static str,
}

impl ToggleResponse {
    fn from(enabled: bool) -> Self {
        Self {
            enabled: if enabled { "on" } else { "off" },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToggleQuery {
    redirect: Option<String>,
}

async fn toggle(
    State(gate): State<EnableGate>,
    Query(query): Query<ToggleQuery>,
) -> impl IntoResponse {
    let enabled = gate.toggle();
    info!("enable gate toggled via HTTP -> {enabled}");
    match query.redirect {
        Some(url) => Redirect::to(&url).into_response(),
        None => Json(ToggleResponse::from(enabled)).into_response(),
    }
}

async fn status(State(gate): State<EnableGate>) -> Json<ToggleResponse> {
    Json(ToggleResponse::from(gate.is_enabled()))
}

pub fn router(gate: EnableGate) -> Router {
    Router::new()
        .route("/api/toggle", get(toggle))
        .route("/api/status", get(status))
        .with_state(gate)
}

/// Serves the router at `bind` until `token` is cancelled, then finishes
/// in-flight requests and closes.
pub async fn serve(
    bind: &str,
    gate: EnableGate,
    token: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP toggle surface listening on {bind}");
    axum::serve(listener, router(gate))
        .with_graceful_shutdown(async move {
            token.cancelled().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_response_shape() {
        assert_eq!(ToggleResponse::from(true).enabled, "on");
        assert_eq!(ToggleResponse::from(false).enabled, "off");
    }
}
