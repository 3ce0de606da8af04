use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use interface::CoreError;

use crate::profile::{ProfileIntegrityManager, DEFAULT_STARTING_BALANCE};
use crate::record::{JournalStore, ProfileStore, SettingsStore};
use crate::sync::{client_from_settings, default_settings, ExchangeSyncService};
use crate::testdata::{GenerateRequest, TestDataGenerator, WipeRequest};
use crate::trades::{
    AddFillRequest, CloseTradeRequest, CreateTradeRequest, PartialCloseRequest, TradeService,
};

/// 핸들러 공유 상태. 핸들러 자체는 무상태이며 저장소 핸들만 공유한다.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JournalStore>,
    pub trades: Arc<TradeService>,
    pub profiles: Arc<ProfileIntegrityManager>,
    pub sync: Arc<ExchangeSyncService>,
    pub generator: Arc<TestDataGenerator>,
}

impl AppState {
    pub fn new<S: JournalStore + 'static>(store: Arc<S>) -> Self {
        let profiles = Arc::new(ProfileIntegrityManager::new(store.clone()));
        let trades = Arc::new(TradeService::new(
            store.clone(),
            ProfileIntegrityManager::new(store.clone()),
        ));
        Self {
            trades,
            profiles,
            sync: Arc::new(ExchangeSyncService::new(store.clone())),
            generator: Arc::new(TestDataGenerator::new(store.clone())),
            store,
        }
    }
}

/// CoreError를 HTTP 응답으로 변환하는 래퍼
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.0.to_string(),
            "error_code": self.0.error_code(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok(value: impl serde::Serialize) -> Response {
    Json(json!({ "success": value })).into_response()
}

/// 소유자 컨텍스트는 x-owner-id 헤더에서 온다. 없으면 401.
fn owner_of(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError(CoreError::AuthRequired))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route("/api/profiles/switch", post(switch_profile))
        .route("/api/trades", get(list_trades).post(create_trade))
        .route("/api/trades/add", post(add_to_position))
        .route("/api/trades/partial-close", post(partial_close))
        .route("/api/trades/close", post(close_trade))
        .route("/api/settings", post(save_settings))
        .route("/api/sync", post(run_sync))
        .route("/api/testdata/generate", post(generate_testdata))
        .route("/api/testdata/wipe", post(wipe_testdata))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(port: u16, state: AppState) -> Result<(), std::io::Error> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

// ---- 프로필 ----

async fn list_profiles(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let owner = owner_of(&headers)?;
    // 조회 경로에서도 기회주의적으로 불변식을 복구한다
    state
        .profiles
        .ensure_default_profile(&owner, DEFAULT_STARTING_BALANCE)
        .await?;
    let profiles = state.store.find_profiles_by_owner(&owner).await.map_err(CoreError::from)?;
    Ok(ok(profiles))
}

#[derive(Deserialize)]
struct CreateProfileBody {
    profile_name: String,
    #[serde(default = "default_balance")]
    starting_balance: f64,
}

fn default_balance() -> f64 {
    DEFAULT_STARTING_BALANCE
}

async fn create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateProfileBody>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let profile = state
        .profiles
        .create_profile(&owner, &body.profile_name, body.starting_balance)
        .await?;
    Ok(ok(profile))
}

#[derive(Deserialize)]
struct SwitchProfileBody {
    profile_id: String,
}

async fn switch_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SwitchProfileBody>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let profile = state.profiles.switch(&owner, &body.profile_id).await?;
    Ok(ok(profile))
}

// ---- 거래 ----

#[derive(Deserialize)]
struct ListTradesQuery {
    #[serde(default)]
    open_only: bool,
    limit: Option<u64>,
    skip: Option<u64>,
}

async fn list_trades(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<ListTradesQuery>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let trades = state
        .trades
        .list(&owner, query.open_only, query.limit, query.skip)
        .await?;
    Ok(ok(trades))
}

async fn create_trade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTradeRequest>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let trade = state.trades.create(&owner, body).await?;
    Ok(ok(trade))
}

#[derive(Deserialize)]
struct TradeActionBody<T> {
    trade_id: String,
    #[serde(flatten)]
    action: T,
}

async fn add_to_position(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TradeActionBody<AddFillRequest>>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let trade = state
        .trades
        .add_to_position(&owner, &body.trade_id, body.action)
        .await?;
    Ok(ok(trade))
}

async fn partial_close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TradeActionBody<PartialCloseRequest>>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let trade = state
        .trades
        .partial_close(&owner, &body.trade_id, body.action)
        .await?;
    Ok(ok(trade))
}

async fn close_trade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TradeActionBody<CloseTradeRequest>>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let trade = state
        .trades
        .close(&owner, &body.trade_id, body.action)
        .await?;
    Ok(ok(trade))
}

// ---- 거래소 연동 ----

#[derive(Deserialize)]
struct SaveSettingsBody {
    api_key: String,
    api_secret: String,
}

async fn save_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveSettingsBody>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    if body.api_key.is_empty() || body.api_secret.is_empty() {
        return Err(ApiError(CoreError::Validation(
            "api_key and api_secret are required".to_string(),
        )));
    }

    // 키 교체 시에도 동기화 커서는 보존한다
    let settings = match state.store.find_settings(&owner).await.map_err(CoreError::from)? {
        Some(mut existing) => {
            existing.api_key = body.api_key;
            existing.api_secret = body.api_secret;
            existing
        }
        None => default_settings(&owner, &body.api_key, &body.api_secret),
    };
    state
        .store
        .upsert_settings(&settings)
        .await
        .map_err(CoreError::from)?;
    Ok(ok(json!({ "saved": true })))
}

/// 동기화 실행. 섹션별 실패는 보고서 안의 errors로 내려가고
/// 호출 자체는 200이다 — 치명적 실패(저장소, 설정 없음)만 에러 응답이 된다.
async fn run_sync(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let owner = owner_of(&headers)?;
    let profile = state.profiles.active_profile(&owner).await?;
    let settings = state
        .store
        .find_settings(&owner)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| {
            CoreError::Validation("exchange credentials not configured".to_string())
        })?;

    let client = client_from_settings(&settings);
    let report = state.sync.sync(&client, &owner, &profile.id).await?;
    Ok(ok(report))
}

// ---- 테스트 데이터 ----

#[derive(Deserialize)]
struct GenerateBody {
    count: u64,
    #[serde(default)]
    seed: u64,
    #[serde(default = "default_mode")]
    mode: String,
    test_run_id: Option<String>,
    profile_id: Option<String>,
}

fn default_mode() -> String {
    "mixed".to_string()
}

async fn generate_testdata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    // profile_id 생략 시 활성 프로필 대상
    let profile_id = match body.profile_id {
        Some(id) => id,
        None => state.profiles.active_profile(&owner).await?.id,
    };

    let report = state
        .generator
        .generate(GenerateRequest {
            owner,
            profile_id,
            count: body.count,
            seed: body.seed,
            mode: body.mode,
            test_run_id: body.test_run_id,
        })
        .await?;
    Ok(ok(report))
}

#[derive(Deserialize)]
struct WipeBody {
    profile_id: Option<String>,
    test_run_id: Option<String>,
}

async fn wipe_testdata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WipeBody>,
) -> ApiResult {
    let owner = owner_of(&headers)?;
    let profile_id = match body.profile_id {
        Some(id) => id,
        None => state.profiles.active_profile(&owner).await?.id,
    };

    let deleted = state
        .generator
        .wipe(WipeRequest {
            owner,
            profile_id,
            test_run_id: body.test_run_id,
        })
        .await?;
    Ok(ok(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryJournalStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let store = Arc::new(MemoryJournalStore::new());
        build_router(AppState::new(store))
    }

    #[tokio::test]
    async fn test_missing_owner_header_is_401() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/profiles")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_profiles_auto_provision_on_first_read() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/profiles")
                    .header("x-owner-id", "user1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let profiles = value["success"].as_array().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0]["profile_name"], "Default");
        assert_eq!(profiles[0]["is_active"], true);
    }

    #[tokio::test]
    async fn test_sync_without_settings_is_400() {
        let app = router();

        // 먼저 프로필을 만들어 둔다
        app.clone()
            .oneshot(
                Request::builder()
                    .uri("/api/profiles")
                    .header("x-owner-id", "user1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .header("x-owner-id", "user1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error_code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_trade_lifecycle_over_http() {
        let app = router();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/trades")
                    .header("x-owner-id", "user1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "coin": "BTCUSDT",
                            "direction": "LONG",
                            "entry_price": 100.0,
                            "position_size": 1000.0,
                            "stop_price": 95.0
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let trade_id = value["success"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/trades/close")
                    .header("x-owner-id", "user1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "trade_id": trade_id, "close_price": 110.0 }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"]["pnl_usd"], 100.0);
    }

    #[tokio::test]
    async fn test_validation_error_body_shape() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/trades")
                    .header("x-owner-id", "user1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "coin": "",
                            "direction": "LONG",
                            "entry_price": 100.0,
                            "position_size": 1000.0
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["error"].is_string());
        assert_eq!(value["error_code"], "VALIDATION_ERROR");
    }
}
