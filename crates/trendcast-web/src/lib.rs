//! Axum pull endpoint + SSE push channel for trendcast.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use trendcast_sync::{HubEvent, ScrapePhase, TrendHub, TrendsView};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendcast-web";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<TrendHub>,
}

impl AppState {
    pub fn new(hub: Arc<TrendHub>) -> Self {
        Self { hub }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    phase: ScrapePhase,
    has_snapshot: bool,
    subscribers: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/trends", get(trends_handler))
        .route("/api/trends/stream", get(stream_handler))
        .route("/healthz", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(hub: Arc<TrendHub>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server running on http://localhost:{port}");
    axum::serve(listener, app(AppState::new(hub))).await?;
    Ok(())
}

async fn trends_handler(State(state): State<Arc<AppState>>) -> Json<TrendsView> {
    Json(state.hub.pull())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    let scrape = state.hub.state();
    Json(Health {
        status: "ok",
        phase: scrape.phase,
        has_snapshot: scrape.last_snapshot.is_some(),
        subscribers: state.hub.subscriber_count(),
    })
}

/// Logs the disconnect once the client's stream is dropped.
struct ConnectionGuard(Uuid);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        info!(subscriber = %self.0, "client disconnected");
    }
}

fn to_sse(event: &HubEvent) -> Option<SseEvent> {
    let payload = match event.payload_json() {
        Ok(payload) => payload,
        Err(err) => {
            error!(event = event.name(), error = %err, "failed to serialize push payload");
            return None;
        }
    };
    match SseEvent::default().event(event.name()).json_data(payload) {
        Ok(sse) => Some(sse),
        Err(err) => {
            error!(event = event.name(), error = %err, "failed to encode sse event");
            None
        }
    }
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.hub.subscribe();
    let guard = ConnectionGuard(subscription.id);

    let initial = tokio_stream::iter(to_sse(&subscription.initial).map(Ok));
    let updates = BroadcastStream::new(subscription.receiver).filter_map(move |event| {
        let connection = &guard;
        match event {
            Ok(event) => to_sse(&event).map(Ok),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(subscriber = %connection.0, missed, "subscriber lagged, skipping missed updates");
                None
            }
        }
    });

    Sse::new(initial.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use trendcast_core::{system_clock, Clock, RawTrend, TrendRecord, TrendSnapshot};
    use trendcast_sync::Trigger;

    fn hub() -> Arc<TrendHub> {
        Arc::new(TrendHub::new(Duration::from_secs(30 * 60), system_clock()))
    }

    fn snapshot(terms: &[(&str, &str)]) -> TrendSnapshot {
        let records: Vec<_> = terms
            .iter()
            .filter_map(|(t, v)| TrendRecord::from_raw(&RawTrend::new(*t, *v)))
            .collect();
        TrendSnapshot::new(records, system_clock().now()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn pull_before_any_collection_is_empty_and_not_fresh() {
        let resp = app(AppState::new(hub())).oneshot(get("/api/trends")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["data"], serde_json::json!([]));
        assert!(body["timestamp"].is_null());
        assert!(body["age"].is_null());
        assert_eq!(body["fresh"], false);
        assert_eq!(body["isScrapingInProgress"], false);
    }

    #[tokio::test]
    async fn pull_returns_seeded_snapshot() {
        let hub = hub();
        hub.seed(snapshot(&[("storm", "45K+"), ("election", "1.2M+")]));
        hub.try_begin(Trigger::Timer).unwrap();

        let resp = app(AppState::new(hub)).oneshot(get("/api/trends")).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["data"][0]["text"], "storm");
        assert_eq!(body["data"][1]["volume"], 1_200_000.0);
        assert_eq!(body["fresh"], true);
        assert_eq!(body["isScrapingInProgress"], true);
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn cors_headers_are_present() {
        let req = Request::builder()
            .uri("/api/trends")
            .header(header::ORIGIN, "chrome-extension://abc")
            .body(Body::empty())
            .unwrap();
        let resp = app(AppState::new(hub())).oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn health_reports_phase() {
        let resp = app(AppState::new(hub())).oneshot(get("/healthz")).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["hasSnapshot"], false);
    }

    async fn next_frame(body: &mut Body) -> String {
        let frame = body.frame().await.expect("frame").expect("body ok");
        String::from_utf8(frame.into_data().expect("data frame").to_vec()).unwrap()
    }

    #[tokio::test]
    async fn stream_without_data_starts_with_status_event() {
        let hub = hub();
        hub.try_begin(Trigger::Startup).unwrap();
        let resp = app(AppState::new(hub)).oneshot(get("/api/trends/stream")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );

        let mut body = resp.into_body();
        let first = next_frame(&mut body).await;
        assert!(first.contains("event: status"), "{first}");
        assert!(first.contains("\"isScrapingInProgress\":true"), "{first}");
    }

    #[tokio::test]
    async fn stream_delivers_current_snapshot_then_updates() {
        let hub = hub();
        hub.seed(snapshot(&[("storm", "45K+")]));
        let resp = app(AppState::new(hub.clone()))
            .oneshot(get("/api/trends/stream"))
            .await
            .unwrap();
        let mut body = resp.into_body();

        let first = next_frame(&mut body).await;
        assert!(first.contains("event: trends-update"), "{first}");
        assert!(first.contains("storm"), "{first}");
        assert_eq!(hub.subscriber_count(), 1);

        hub.try_begin(Trigger::Timer).unwrap();
        assert_eq!(hub.publish(Arc::new(snapshot(&[("eclipse", "2M+")]))), 1);

        let second = next_frame(&mut body).await;
        assert!(second.contains("event: trends-update"), "{second}");
        assert!(second.contains("eclipse"), "{second}");
        assert!(second.contains("\"fresh\":true"), "{second}");

        drop(body);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
