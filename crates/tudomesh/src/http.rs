//! HTTP server built on `axum`. Every handler reads the shared context;
//! none mutates the calibration store directly — only the
//! ingress/recalibration path does that.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use tudomesh_render::{render_composite, render_composite_vector, Color, MapLayer, RenderOptions};

use crate::context::AppContext;

pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/poses", get(poses))
        .route("/poses/:id", get(pose_by_id))
        .route("/render", get(render))
        .merge(context.metrics.router())
        .with_state(context)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[derive(Serialize)]
struct PoseDto {
    vacuum_id: String,
    x: f64,
    y: f64,
    angle: f64,
}

impl From<tudomesh_core::pose::LivePose> for PoseDto {
    fn from(p: tudomesh_core::pose::LivePose) -> Self {
        Self {
            vacuum_id: p.vacuum_id,
            x: p.x,
            y: p.y,
            angle: p.heading_deg,
        }
    }
}

async fn poses(State(context): State<Arc<AppContext>>) -> Json<Vec<PoseDto>> {
    context.metrics.http_requests_total.inc();
    Json(context.all_poses().into_iter().map(PoseDto::from).collect())
}

async fn pose_by_id(
    State(context): State<Arc<AppContext>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    context.metrics.http_requests_total.inc();
    match context.pose(&id) {
        Some(pose) => Json(PoseDto::from(pose)).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown vacuum id").into_response(),
    }
}

#[derive(Deserialize)]
struct RenderQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn render(State(context): State<Arc<AppContext>>, Query(query): Query<RenderQuery>) -> Response {
    context.metrics.http_requests_total.inc();

    let vacuum_ids = context.known_vacuum_ids();
    let reference_id = context.reference_id();
    let mut maps = Vec::new();
    for id in std::iter::once(reference_id.clone())
        .chain(vacuum_ids.into_iter().filter(|id| id != &reference_id))
    {
        if let Some(map) = context.map_snapshot(&id) {
            let (transform, _) = context.get_transform(&id);
            maps.push((id, map, transform));
        }
    }

    if maps.is_empty() {
        return (StatusCode::NOT_FOUND, "no maps known yet").into_response();
    }

    let layers: Vec<MapLayer> = maps
        .iter()
        .map(|(id, map, transform)| {
            let color = context
                .config
                .vacuums
                .iter()
                .find(|v| &v.id == id)
                .and_then(|v| v.color.as_deref())
                .and_then(Color::from_hex)
                .unwrap_or(Color::DEFAULT_WALL);
            MapLayer {
                vacuum_id: id,
                map,
                transform: *transform,
                color,
            }
        })
        .collect();

    let opts = RenderOptions {
        grid_spacing_mm: context.config.grid_spacing,
        ..Default::default()
    };

    let wants_vector = query.format.as_deref() == Some("vector");
    if wants_vector {
        match render_composite_vector(&layers, &opts) {
            Ok(doc) => ([(header::CONTENT_TYPE, "image/svg+xml")], doc.into_string()).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    } else {
        match render_composite(&layers, &opts).and_then(|img| img.encode_png().map_err(Into::into)) {
            Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let context = AppContext::new(
            Config::default(),
            dir.path().to_path_buf(),
            dir.path().join("calibration.json"),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        let _ = dir;
        router(context)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let response = test_router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_pose_id_is_404() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/poses/unknown-robot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn render_with_no_maps_is_404() {
        let response = test_router()
            .oneshot(Request::builder().uri("/render").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_route_is_mounted() {
        let response = test_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
