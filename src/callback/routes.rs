//! HTTP surface for daemon callbacks.
//!
//! Bound to a local address; the VPN daemon's hook scripts call it, and
//! `GET /status` serves operators.

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handler::{AuthCallbackHandler, AuthReply, ConnectReply, StatusReport};
use crate::error::EdgeError;

/// Header carrying the already-authenticated username.
pub const USERNAME_HEADER: &str = "x-username";
/// Header carrying the client's public address.
pub const REMOTE_IP_HEADER: &str = "x-remote-ip";

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Wrapper for callback errors to implement IntoResponse
pub struct ApiError(EdgeError);

impl From<EdgeError> for ApiError {
    fn from(err: EdgeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EdgeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EdgeError::PoolExhausted { .. } | EdgeError::PoolMisconfigured(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EdgeError::NotFound(_) => StatusCode::NOT_FOUND,
            EdgeError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remote_ip: String,
}

#[derive(Debug, Deserialize)]
pub struct ActivityRequest {
    pub username: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_username(headers: &HeaderMap) -> Result<String, ApiError> {
    header(headers, USERNAME_HEADER).ok_or_else(|| {
        ApiError(EdgeError::InvalidParameter(format!(
            "missing {} header",
            USERNAME_HEADER
        )))
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "edgevpnd",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status(State(handler): State<Arc<AuthCallbackHandler>>) -> Json<StatusReport> {
    Json(handler.status().await)
}

async fn authenticate(
    State(handler): State<Arc<AuthCallbackHandler>>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<AuthReply>, ApiError> {
    let reply = handler
        .authenticate(&req.username, &req.password, &req.remote_ip)
        .await?;
    Ok(Json(reply))
}

async fn connect(
    State(handler): State<Arc<AuthCallbackHandler>>,
    headers: HeaderMap,
) -> Result<Json<ConnectReply>, ApiError> {
    let username = required_username(&headers)?;
    let remote_ip = header(&headers, REMOTE_IP_HEADER).unwrap_or_default();
    let reply = handler.connect(&username, &remote_ip).await?;
    Ok(Json(reply))
}

async fn disconnect(
    State(handler): State<Arc<AuthCallbackHandler>>,
    headers: HeaderMap,
) -> Result<Json<AuthReply>, ApiError> {
    let username = required_username(&headers)?;
    Ok(Json(handler.disconnect(&username).await?))
}

async fn activity(
    State(handler): State<Arc<AuthCallbackHandler>>,
    Json(req): Json<ActivityRequest>,
) -> Result<Json<AuthReply>, ApiError> {
    Ok(Json(
        handler
            .activity(&req.username, req.upload, req.download)
            .await?,
    ))
}

pub fn router(handler: Arc<AuthCallbackHandler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/auth", post(authenticate))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/activity", post(activity))
        .with_state(handler)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::handler::tests::{handler, handler_with};
    use crate::daemon::{DaemonStatus, MockDaemonControl};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        router(Arc::new(handler().await))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn auth_request(password: &str) -> Request<Body> {
        Request::post("/auth")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "username": "alice",
                    "password": password,
                    "remote_ip": "203.0.113.7"
                })
                .to_string(),
            ))
            .unwrap()
    }

    fn connect_request() -> Request<Body> {
        Request::post("/connect")
            .header(USERNAME_HEADER, "alice")
            .header(REMOTE_IP_HEADER, "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_with_daemon_down() {
        let mut control = MockDaemonControl::new();
        control.expect_show_status().returning(|| DaemonStatus {
            running: false,
            active_users: None,
            error: Some("no socket".to_string()),
        });
        let app = router(Arc::new(handler_with(control).await));

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["daemon"]["running"], false);
        assert_eq!(body["daemon"]["error"], "no socket");
        assert_eq!(body["sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_bad_password_is_401() {
        let response = app().await.oneshot(auth_request("wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_auth_then_connect() {
        let app = app().await;

        let response = app.clone().oneshot(auth_request("secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "status": "ok" }));

        let response = app.clone().oneshot(connect_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["address"], "192.168.100.1");
        assert_eq!(body["netmask"], "255.255.255.0");
        assert_eq!(body["dns"], serde_json::json!(["8.8.8.8", "8.8.4.4"]));
        assert_eq!(body["mtu"], 1400);

        let response = app
            .oneshot(
                Request::post("/disconnect")
                    .header(USERNAME_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_connect_without_auth_is_401() {
        let response = app().await.oneshot(connect_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connect_without_header_is_400() {
        let response = app()
            .await
            .oneshot(Request::post("/connect").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_activity_for_unknown_user_is_ignored() {
        let response = app()
            .await
            .oneshot(
                Request::post("/activity")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"ghost","upload":1,"download":2}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ignored");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EdgeError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (EdgeError::PoolExhausted { group: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (EdgeError::PoolMisconfigured("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EdgeError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EdgeError::InvalidParameter("x".into()), StatusCode::BAD_REQUEST),
            (EdgeError::AlreadyRunning, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
