//! Axum JSON read API over the facility store.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tfd_core::normalize_region_code;
use tfd_storage::{fetch_all_regions, FacilityStore, StoreError, MAX_BATCH_ROWS};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tfd-web";

pub const DEFAULT_CITY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FacilityStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn FacilityStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct IdPage {
    pub offset: usize,
    pub limit: usize,
    pub ids: Vec<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/facilities/indexable-ids", get(indexable_ids_handler))
        .route("/facilities/{slug}", get(facility_handler))
        .route("/regions", get(regions_handler))
        .route(
            "/regions/{code}/cities/{city_slug}/facilities",
            get(city_facilities_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "read API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn facility_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    match state.store.facility_by_slug(&slug).await {
        Ok(Some(facility)) => Json(facility).into_response(),
        Ok(None) => not_found(format!("no facility with slug {slug}")),
        Err(err) => server_error(err),
    }
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> Response {
    match fetch_all_regions(state.store.as_ref()).await {
        Ok(regions) => Json(regions).into_response(),
        Err(err) => server_error(err),
    }
}

async fn city_facilities_handler(
    State(state): State<Arc<AppState>>,
    Path((code, city_slug)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CITY_LIMIT)
        .clamp(1, MAX_BATCH_ROWS);
    let code = normalize_region_code(&code);
    match state
        .store
        .facilities_in_sub_region(&code, &city_slug, limit)
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn indexable_ids_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(MAX_BATCH_ROWS).clamp(1, MAX_BATCH_ROWS);
    match state.store.indexable_ids_page(offset, limit).await {
        Ok(ids) => Json(IdPage { offset, limit, ids }).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "store read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tfd_core::Facility;
    use tfd_storage::MemoryStore;
    use tower::ServiceExt;

    fn facility(external_id: &str, city: &str, score: f64) -> Facility {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        Facility {
            id: Facility::id_for_external_id(external_id),
            external_id: external_id.to_string(),
            slug: format!("facility-{external_id}"),
            name: format!("Facility {external_id}"),
            alternate_name: None,
            street1: None,
            street2: None,
            city: city.to_string(),
            sub_region_slug: city.to_ascii_lowercase(),
            region_code: "TX".into(),
            region_name: "Texas".into(),
            zip: None,
            phone: None,
            intake_phone: None,
            hotline: None,
            website: None,
            latitude: None,
            longitude: None,
            facility_type: None,
            care_types: vec![],
            settings: vec![],
            payment_options: vec![],
            age_groups: vec![],
            special_programs: vec![],
            quality_score: score,
            indexable: score >= 0.7,
            created_at: ts,
            updated_at: ts,
        }
    }

    async fn test_app() -> Router {
        let store = MemoryStore::new();
        store
            .upsert_facilities(&[
                facility("1", "Austin", 0.9),
                facility("2", "Austin", 0.75),
                facility("3", "Austin", 0.4),
                facility("4", "Dallas", 0.8),
            ])
            .await
            .unwrap();
        app(AppState::new(Arc::new(store)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let (status, body) = get_json(test_app().await, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn facility_by_slug_and_missing_slug() {
        let app = test_app().await;
        let (status, body) = get_json(app.clone(), "/facilities/facility-4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["external_id"], "4");

        let (status, _) = get_json(app, "/facilities/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn city_listing_is_indexable_only_best_first() {
        let (status, body) =
            get_json(test_app().await, "/regions/tx/cities/austin/facilities?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let ids = body
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["external_id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn indexable_ids_are_paged() {
        let app = test_app().await;
        let (status, body) = get_json(app.clone(), "/facilities/indexable-ids?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ids"].as_array().unwrap().len(), 2);

        let (_, rest) = get_json(app, "/facilities/indexable-ids?offset=2&limit=5000").await;
        assert_eq!(rest["limit"], 1000);
        assert_eq!(rest["ids"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn regions_listing_is_json() {
        let (status, body) = get_json(test_app().await, "/regions").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }
}
