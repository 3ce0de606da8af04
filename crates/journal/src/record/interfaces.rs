use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use interface::{CoreError, Direction, Fill, ImportSource, PartialClose};

/// 거래/포지션 레코드
/// `close_price == None` 이면 열린 포지션이다 (불변식).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    /// 거래소 미러링용 결정적 키 (수동 입력이면 None)
    pub external_id: Option<String>,
    pub coin: String,
    pub direction: Direction,
    /// 현재 평균 진입가 (추가 진입 반영)
    pub entry_price: f64,
    /// 최초 진입가 (추가 진입과 무관)
    pub original_entry_price: f64,
    /// USD 명목 금액
    pub position_size: f64,
    pub stop_price: Option<f64>,
    pub take_price: Option<f64>,
    pub close_price: Option<f64>,
    pub date_open: DateTime<Utc>,
    pub date_close: Option<DateTime<Utc>>,
    /// 진입 시점에 리스크로 건 금액 스냅샷. 추가 진입/부분 청산으로
    /// 갱신되지 않는다 — R-배수의 분모가 된다.
    /// 스탑이 없으면 None ("리스크 미정의" — 절대 0으로 강제하지 않는다)
    pub risk_usd: Option<f64>,
    pub risk_percent: Option<f64>,
    pub rr_ratio: Option<f64>,
    pub pnl_usd: f64,
    pub pnl_percent_of_balance: f64,
    pub r_multiple: Option<f64>,
    pub realized_pnl_usd: f64,
    /// 추가 진입 이력 (시간순)
    pub adds_history: Vec<Fill>,
    /// 부분 청산 이력 (시간순)
    pub partial_closes: Vec<PartialClose>,
    pub account_balance_at_entry: Option<f64>,
    /// 테스트 데이터 생성기가 만든 경우에만 설정
    pub test_run_id: Option<String>,
    pub import_source: ImportSource,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.close_price.is_none()
    }
}

/// 사용자 프로필
/// 불변식: 치유된 상태에서는 소유자당 is_active == true 가 정확히 1개.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub owner: String,
    pub is_active: bool,
    pub profile_name: String,
    pub starting_balance: f64,
    pub updated_date: DateTime<Utc>,
}

/// 거래소 연동 설정과 동기화 커서
/// 커서는 단조 비감소이며 해당 fetch가 성공한 뒤에만 전진한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub owner: String,
    pub api_key: String,
    pub api_secret: String,
    pub bybit_sync_initialized: bool,
    pub closed_baseline_ms: i64,
    pub exec_baseline_ms: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// 테스트 데이터 생성 1회를 나타내는 멱등성 마커
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub test_run_id: String,
    pub profile_id: String,
    pub owner: String,
    pub count: u64,
    pub seed: u64,
    pub mode: String,
    pub created_at: DateTime<Utc>,
}

/// 거래 조회 필터. owner는 필수 — 소유자 범위를 벗어난 조회는 구조적으로 불가능하다.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub owner: String,
    pub profile_id: Option<String>,
    pub test_run_id: Option<String>,
    pub open_only: bool,
}

impl TradeFilter {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    pub fn profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn test_run(mut self, test_run_id: impl Into<String>) -> Self {
        self.test_run_id = Some(test_run_id.into());
        self
    }

    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }
}

/// 거래 레코드 저장소 인터페이스
/// 확장성을 위해 트레이트로 정의하여 나중에 다른 DB로 전환 가능
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create(&self, trade: &Trade) -> Result<(), RecordError>;

    /// 거래 여러 개 일괄 저장
    async fn bulk_create(&self, trades: &[Trade]) -> Result<(), RecordError>;

    async fn update(&self, trade: &Trade) -> Result<(), RecordError>;

    /// 소유자 범위 내에서 id 목록 삭제, 삭제된 행 수 반환
    async fn delete_by_ids(&self, owner: &str, ids: &[String]) -> Result<u64, RecordError>;

    async fn find_by_id(&self, owner: &str, id: &str) -> Result<Option<Trade>, RecordError>;

    /// external_id로 조회 (업서트의 기반)
    async fn find_by_external_id(
        &self,
        owner: &str,
        external_id: &str,
    ) -> Result<Option<Trade>, RecordError>;

    /// 필터 조회 (limit/skip 페이지네이션)
    async fn filter(
        &self,
        filter: &TradeFilter,
        limit: Option<u64>,
        skip: Option<u64>,
    ) -> Result<Vec<Trade>, RecordError>;

    async fn count(&self, filter: &TradeFilter) -> Result<u64, RecordError>;

    /// 필터에 해당하는 id를 cap 한도까지 수집 (일괄 삭제용)
    async fn collect_ids(&self, filter: &TradeFilter, cap: u64) -> Result<Vec<String>, RecordError>;
}

/// 프로필 저장소 인터페이스
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn create_profile(&self, profile: &UserProfile) -> Result<(), RecordError>;

    async fn update_profile(&self, profile: &UserProfile) -> Result<(), RecordError>;

    async fn find_profile(&self, id: &str) -> Result<Option<UserProfile>, RecordError>;

    /// 소유자의 프로필 전체, updated_date 내림차순
    async fn find_profiles_by_owner(&self, owner: &str) -> Result<Vec<UserProfile>, RecordError>;
}

/// 거래소 연동 설정 저장소 인터페이스
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn find_settings(&self, owner: &str) -> Result<Option<ApiSettings>, RecordError>;

    async fn upsert_settings(&self, settings: &ApiSettings) -> Result<(), RecordError>;
}

/// 테스트 실행 마커 저장소 인터페이스
#[async_trait]
pub trait TestRunStore: Send + Sync {
    async fn create_test_run(&self, run: &TestRun) -> Result<(), RecordError>;

    async fn find_test_run(
        &self,
        owner: &str,
        profile_id: &str,
        test_run_id: &str,
    ) -> Result<Option<TestRun>, RecordError>;
}

/// 코어 엔진이 쓰는 저장소 묶음
pub trait JournalStore: TradeStore + ProfileStore + SettingsStore + TestRunStore {}

impl<T> JournalStore for T where T: TradeStore + ProfileStore + SettingsStore + TestRunStore {}

/// 기록 저장소 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<RecordError> for CoreError {
    fn from(e: RecordError) -> Self {
        CoreError::Storage(e.to_string())
    }
}

/// SeaORM trades::Model을 Trade로 변환
impl TryFrom<super::entities::trades::Model> for Trade {
    type Error = RecordError;

    fn try_from(model: super::entities::trades::Model) -> Result<Self, Self::Error> {
        let date_open = parse_datetime(&model.date_open)?;
        let date_close = model.date_close.as_deref().map(parse_datetime).transpose()?;

        let direction = Direction::from_str(&model.direction).map_err(RecordError::Other)?;
        let import_source =
            ImportSource::from_str(&model.import_source).map_err(RecordError::Other)?;

        // 이력 블롭은 저장소 경계에서만 JSON으로 직렬화된다
        let adds_history: Vec<Fill> = serde_json::from_str(&model.adds_history)?;
        let partial_closes: Vec<PartialClose> = serde_json::from_str(&model.partial_closes)?;

        Ok(Trade {
            id: model.id,
            owner: model.owner,
            profile_id: model.profile_id,
            external_id: model.external_id,
            coin: model.coin,
            direction,
            entry_price: model.entry_price,
            original_entry_price: model.original_entry_price,
            position_size: model.position_size,
            stop_price: model.stop_price,
            take_price: model.take_price,
            close_price: model.close_price,
            date_open,
            date_close,
            risk_usd: model.risk_usd,
            risk_percent: model.risk_percent,
            rr_ratio: model.rr_ratio,
            pnl_usd: model.pnl_usd,
            pnl_percent_of_balance: model.pnl_percent_of_balance,
            r_multiple: model.r_multiple,
            realized_pnl_usd: model.realized_pnl_usd,
            adds_history,
            partial_closes,
            account_balance_at_entry: model.account_balance_at_entry,
            test_run_id: model.test_run_id,
            import_source,
        })
    }
}

/// SeaORM user_profiles::Model을 UserProfile로 변환
impl TryFrom<super::entities::user_profiles::Model> for UserProfile {
    type Error = RecordError;

    fn try_from(model: super::entities::user_profiles::Model) -> Result<Self, Self::Error> {
        Ok(UserProfile {
            id: model.id,
            owner: model.owner,
            is_active: model.is_active,
            profile_name: model.profile_name,
            starting_balance: model.starting_balance,
            updated_date: parse_datetime(&model.updated_date)?,
        })
    }
}

/// SeaORM api_settings::Model을 ApiSettings로 변환
impl TryFrom<super::entities::api_settings::Model> for ApiSettings {
    type Error = RecordError;

    fn try_from(model: super::entities::api_settings::Model) -> Result<Self, Self::Error> {
        let last_sync = model.last_sync.as_deref().map(parse_datetime).transpose()?;

        Ok(ApiSettings {
            owner: model.owner,
            api_key: model.api_key,
            api_secret: model.api_secret,
            bybit_sync_initialized: model.bybit_sync_initialized,
            closed_baseline_ms: model.closed_baseline_ms,
            exec_baseline_ms: model.exec_baseline_ms,
            last_sync,
        })
    }
}

/// SeaORM test_runs::Model을 TestRun으로 변환
impl TryFrom<super::entities::test_runs::Model> for TestRun {
    type Error = RecordError;

    fn try_from(model: super::entities::test_runs::Model) -> Result<Self, Self::Error> {
        Ok(TestRun {
            test_run_id: model.test_run_id,
            profile_id: model.profile_id,
            owner: model.owner,
            count: model.count as u64,
            seed: model.seed as u64,
            mode: model.mode,
            created_at: parse_datetime(&model.created_at)?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecordError::Other(format!("Failed to parse datetime '{}': {}", s, e)))
}
