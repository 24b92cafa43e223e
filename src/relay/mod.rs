//! Negotiation relay.
//!
//! A one-shot forwarding endpoint: `POST /api/negotiate` passes the JSON
//! negotiation payload unchanged to the configured upstream offer URL and
//! returns the upstream's JSON response verbatim. Permissive cross-origin
//! headers go out on every response, pre-flight OPTIONS included, so
//! browser clients on any origin can negotiate. Any other method gets a
//! fixed "Method Not Allowed". The relay never retries — a failed forward
//! is the caller's problem to repeat.

use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Negotiation payloads are small SDP blobs; anything bigger is abuse.
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Upper bound on one forward round-trip.
const REQUEST_TIMEOUT_SECS: u64 = 30;

struct RelayState {
    client: reqwest::Client,
    upstream_url: String,
}

/// Build the relay router around a fixed upstream offer URL.
pub fn router(upstream_url: String) -> Router {
    let state = Arc::new(RelayState {
        client: reqwest::Client::new(),
        upstream_url,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route(
            "/api/negotiate",
            post(handle_negotiate).fallback(handle_method_not_allowed),
        )
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Run the relay server until the task is dropped.
pub async fn serve(listen_addr: &str, upstream_url: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        upstream = %upstream_url,
        "negotiation relay listening"
    );
    axum::serve(listener, router(upstream_url)).await?;
    Ok(())
}

/// POST /api/negotiate — forward the payload, echo the upstream's answer.
async fn handle_negotiate(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    tracing::debug!(upstream = %state.upstream_url, "forwarding negotiation payload");

    let upstream = state
        .client
        .post(&state.upstream_url)
        .json(&body)
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status = response.status();
            if !status.is_success() {
                tracing::warn!(status = status.as_u16(), "upstream rejected negotiation");
                // Propagate the underlying status to the caller.
                let code = StatusCode::from_u16(status.as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                return (code, "negotiation upstream error").into_response();
            }
            match response.json::<serde_json::Value>().await {
                Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
                Err(e) => {
                    tracing::error!(error = %e, "upstream returned non-JSON answer");
                    (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "negotiation forward failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

async fn handle_method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_SIZE)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn negotiate_request(payload: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/negotiate")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ORIGIN, "https://calls.example")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_payload_and_echoes_upstream_answer() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/offer"))
            .and(body_json(serde_json::json!({"sdp": "offer", "type": "offer"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"sdp": "answer", "type": "answer"})),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let app = router(format!("{}/offer", upstream.uri()));
        let response = app
            .oneshot(negotiate_request(r#"{"sdp": "offer", "type": "offer"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let answer: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(answer["sdp"], "answer");
    }

    #[tokio::test]
    async fn cors_headers_on_regular_responses() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&upstream)
            .await;

        let app = router(format!("{}/offer", upstream.uri()));
        let response = app.oneshot(negotiate_request("{}")).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn preflight_options_is_answered_with_cors() {
        let app = router("http://127.0.0.1:9/offer".into());
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/negotiate")
            .header(header::ORIGIN, "https://calls.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let methods = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(methods.contains("POST"));
    }

    #[tokio::test]
    async fn other_methods_get_fixed_405() {
        let app = router("http://127.0.0.1:9/offer".into());
        let request = Request::builder()
            .method("GET")
            .uri("/api/negotiate")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_string(response).await, "Method Not Allowed");
    }

    #[tokio::test]
    async fn upstream_error_status_is_propagated() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&upstream)
            .await;

        let app = router(format!("{}/offer", upstream.uri()));
        let response = app.oneshot(negotiate_request("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_500_with_error_text() {
        // Port 9 (discard) — nothing listens there
        let app = router("http://127.0.0.1:9/offer".into());
        let response = app.oneshot(negotiate_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.starts_with("Error:"));
    }
}
