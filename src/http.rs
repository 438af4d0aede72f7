/*! HTTP control plane.

Two verbs on one route, `POST|GET /{device}/{name}`:

* Lighting devices: `name` is a scene; `POST` triggers it, and both verbs
  answer `{"state": bool}`: whether the cached output state overlaps the
  scene pattern.
* Climate devices: a live `DHT` read is issued and the reply (or, when the
  node does not answer, the cached reading) comes back as
  `{"temperature", "humidity"}`.

Every response is JSON, error responses included: unknown devices and
scenes are 404s with an `{"error": ...}` body, and a known device with
neither capability answers a plain `false`.
*/
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use log::info;
use serde_json::{Value, json};

use crate::Result;
use crate::config::CommandSpec;
use crate::hub::Hub;
use crate::message::EventBody;

/// Build the control-plane router.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/:device/:name", get(handle).post(handle))
        .with_state(hub)
}

/// Bind and serve until the process stops.
pub async fn serve(hub: Arc<Hub>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("HTTP server started on port {port}");
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

/// An error status with a JSON body, so failures stay on the JSON
/// contract too.
#[derive(Debug)]
struct ApiError(StatusCode, Value);

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self(status, json!({ "error": message.into() }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(self.1)).into_response()
    }
}

async fn handle(
    State(hub): State<Arc<Hub>>,
    method: Method,
    Path((device, name)): Path<(String, String)>,
) -> std::result::Result<Json<Value>, ApiError> {
    let node = hub.registry().by_name(&device).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, format!("unknown device {device:?}"))
    })?;
    if node.has_option("LIGHT") {
        let Some(pattern) = node.scene(&name).cloned() else {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("unknown scene {name:?} on {device:?}"),
            ));
        };
        if method == Method::POST {
            hub.send_node(&node, &CommandSpec::WithName("LIGHT".to_string(), name.clone()))
                .map_err(|e| {
                    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                })?;
        }
        let lit = node
            .state()
            .lights
            .iter()
            .zip(pattern.iter())
            .any(|(s, p)| *s != 0 && *p != 0);
        info!("{device}:{name} state is {lit}");
        return Ok(Json(json!({ "state": lit })));
    }
    if node.has_option("DHT") {
        let live = match hub
            .request(&node.name, &CommandSpec::Opcode("DHT".to_string()))
            .await
        {
            Ok(event) => match event.body {
                EventBody::Dht {
                    temperature,
                    humidity,
                } => Some((temperature, humidity)),
                _ => None,
            },
            Err(_) => None,
        };
        // The cache answers when the node does not.
        let (temperature, humidity) = match live {
            Some(reading) => reading,
            None => {
                let state = node.state();
                match (state.temperature, state.humidity) {
                    (Some(t), Some(h)) => (t, h),
                    _ => {
                        return Err(ApiError::new(
                            StatusCode::GATEWAY_TIMEOUT,
                            format!("no reading from {device:?}"),
                        ));
                    }
                }
            }
        };
        info!("{device}:{name} state is {temperature}/{humidity}");
        return Ok(Json(
            json!({ "temperature": temperature, "humidity": humidity }),
        ));
    }
    // A known device with neither capability has no state to report.
    info!("{device}:{name} state is false");
    Ok(Json(json!(false)))
}
