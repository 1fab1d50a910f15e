use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::{CommandError, OperatorCommand};
use crate::fleet::{Fleet, FleetError};

pub type AppState = Arc<Fleet>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        let status = match &e {
            FleetError::UnknownGateway(_) | FleetError::NoCapture { .. } => StatusCode::NOT_FOUND,
            FleetError::Connection(_) | FleetError::Command(CommandError::Connection(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FleetError::Command(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/find", post(find_unit))
        .route("/api/gateways/{name}/observe", post(observe))
        .route("/api/gateways/{name}/unobserve", post(unobserve))
        .route("/api/gateways/{name}/command", post(command))
        .route(
            "/api/gateways/{name}/devices/{address}/fast",
            get(fast_series).post(start_fast).delete(stop_fast),
        )
        .with_state(state)
}

async fn api_status(State(fleet): State<AppState>) -> impl IntoResponse {
    Json(fleet.status().await)
}

async fn observe(
    State(fleet): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let registry = fleet.observe(&name).await?;
    let devices = registry.read().await.len();
    Ok(Json(json!({ "gateway": name, "observed": true, "devices": devices })))
}

async fn unobserve(
    State(fleet): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let was_observed = fleet.unobserve(&name).await?;
    Ok(Json(json!({
        "gateway": name,
        "observed": false,
        "was_observed": was_observed,
    })))
}

async fn command(
    State(fleet): State<AppState>,
    Path(name): Path<String>,
    Json(cmd): Json<OperatorCommand>,
) -> ApiResult<impl IntoResponse> {
    fleet.execute(&name, &cmd).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "gateway": name, "sent": true })),
    ))
}

#[derive(Debug, Deserialize)]
struct FindRequest {
    address: String,
}

async fn find_unit(
    State(fleet): State<AppState>,
    Json(req): Json<FindRequest>,
) -> ApiResult<impl IntoResponse> {
    let gateway = fleet.find_unit(&req.address).await?;
    Ok(Json(json!({
        "address": req.address,
        "found": gateway.is_some(),
        "gateway": gateway,
    })))
}

async fn fast_series(
    State(fleet): State<AppState>,
    Path((name, address)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(fleet.fast_series(&name, &address).await?))
}

async fn start_fast(
    State(fleet): State<AppState>,
    Path((name, address)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    fleet.start_fast_capture(&name, &address).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "gateway": name, "address": address, "capturing": true })),
    ))
}

async fn stop_fast(
    State(fleet): State<AppState>,
    Path((name, address)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(fleet.stop_fast_capture(&name, &address).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{GatewayConnection, Loopback};
    use crate::fleet::FleetSettings;
    use crate::schema::TelemetrySchema;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Router, AppState, Loopback) {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        let schema = TelemetrySchema::builtin();
        let header = schema.default_header();
        let fleet = Arc::new(Fleet::from_connections(
            FleetSettings::default(),
            schema,
            header,
            vec![conn],
        ));
        (router(Arc::clone(&fleet)), fleet, lb)
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    // -- status -------------------------------------------------------------

    #[tokio::test]
    async fn status_lists_gateways() {
        let (app, _fleet, _lb) = app();
        let (status, body) = send(app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["namespace"], "Yotta");
        assert_eq!(body["gateways"][0]["name"], "gw1");
        assert_eq!(body["gateways"][0]["observed"], false);
        assert_eq!(body["header"][0], "#");
    }

    // -- observe ------------------------------------------------------------

    #[tokio::test]
    async fn observe_and_unobserve() {
        let (app, fleet, _lb) = app();
        let (status, body) =
            send(app.clone(), Method::POST, "/api/gateways/gw1/observe", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["observed"], true);
        assert!(fleet.is_observed("gw1").await);

        let (status, body) = send(app, Method::POST, "/api/gateways/gw1/unobserve", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["was_observed"], true);
        assert!(!fleet.is_observed("gw1").await);
    }

    #[tokio::test]
    async fn unknown_gateway_is_404() {
        let (app, _fleet, _lb) = app();
        let (status, body) = send(app, Method::POST, "/api/gateways/gw9/observe", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown gateway 'gw9'");
    }

    // -- commands -----------------------------------------------------------

    #[tokio::test]
    async fn command_is_published() {
        let (app, _fleet, mut lb) = app();
        let (status, _) = send(
            app,
            Method::POST,
            "/api/gateways/gw1/command",
            Some(json!({ "command": "parameter", "address": "aabbccddeeff", "name": "port_off", "value": "2" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let sent = lb.drain_published();
        assert_eq!(sent[0].topic, "Yotta/aabbccddeeff/cmd");
        assert_eq!(sent[0].payload, "port_off 2");
    }

    #[tokio::test]
    async fn invalid_command_input_is_400() {
        let (app, _fleet, mut lb) = app();
        let (status, body) = send(
            app,
            Method::POST,
            "/api/gateways/gw1/command",
            Some(json!({ "command": "ssid", "address": "aabbccddeeff", "ssid": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "SSID must not be empty");
        assert!(lb.drain_published().is_empty());
    }

    #[tokio::test]
    async fn disconnected_gateway_is_503() {
        let (app, fleet, _lb) = app();
        fleet.connection("gw1").unwrap().disconnect();
        let (status, _) = send(
            app,
            Method::POST,
            "/api/gateways/gw1/command",
            Some(json!({ "command": "identify" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    // -- find ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn find_reports_not_found() {
        let (app, _fleet, mut lb) = app();
        let (status, body) = send(
            app,
            Method::POST,
            "/api/find",
            Some(json!({ "address": "24d7eb516930" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], false);
        assert_eq!(body["gateway"], Value::Null);
        assert_eq!(lb.drain_published()[0].payload, "getid");
    }

    #[tokio::test]
    async fn find_rejects_bad_address() {
        let (app, _fleet, _lb) = app();
        let (status, _) = send(
            app,
            Method::POST,
            "/api/find",
            Some(json!({ "address": "123" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- fast capture -------------------------------------------------------

    #[tokio::test]
    async fn fast_capture_lifecycle() {
        let (app, _fleet, mut lb) = app();
        let uri = "/api/gateways/gw1/devices/aabbccddeeff/fast";

        let (status, _) = send(app.clone(), Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app.clone(), Method::POST, uri, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = send(app.clone(), Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], "aabbccddeeff");
        assert_eq!(body["series"].as_array().unwrap().len(), 10);

        let (status, _) = send(app, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::OK);

        let payloads: Vec<String> = lb.drain_published().into_iter().map(|o| o.payload).collect();
        assert_eq!(payloads, vec!["set fast_period 1", "set fast_period 0"]);
    }

    #[tokio::test]
    async fn stopping_missing_capture_is_404_and_silent() {
        let (app, _fleet, mut lb) = app();
        let uri = "/api/gateways/gw1/devices/aabbccddeeff/fast";
        let (status, body) = send(app, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no fast capture for aabbccddeeff on 'gw1'");
        assert!(lb.drain_published().is_empty());
    }
}
