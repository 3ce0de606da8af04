use async_trait::async_trait;
use sea_orm::sea_query::Index;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Schema, Set,
};
use std::env;
use std::path::PathBuf;
use tracing::info;

use super::entities::{api_settings, test_runs, trades, user_profiles};
use super::{
    ApiSettings, ProfileStore, RecordError, SettingsStore, TestRun, TestRunStore, Trade,
    TradeFilter, TradeStore, UserProfile,
};

/// SQLite 기반 저널 저장소
/// 거래/프로필/연동 설정/테스트 실행 마커를 하나의 DB 파일에 저장한다.
pub struct SqliteJournalStore {
    db: DatabaseConnection,
}

impl SqliteJournalStore {
    /// 새로운 SQLite 저장소 인스턴스 생성
    /// DB 파일 경로는 환경 변수 DB_PATH로 지정 가능 (기본값: "journal.db")
    pub async fn new() -> Result<Self, RecordError> {
        let db_path = env::var("DB_PATH").unwrap_or_else(|_| "journal.db".to_string());

        // 절대 경로 또는 상대 경로 처리
        let mut path = PathBuf::from(&db_path);
        if !path.is_absolute() {
            if let Ok(current_dir) = env::current_dir() {
                path = current_dir.join(&db_path);
            }
        }

        // 디렉토리가 없으면 생성
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RecordError::Other(format!("Failed to create DB directory: {}", e)))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());
        Self::connect(&db_url).await
    }

    /// URL로 직접 연결 (테스트용 in-memory 포함)
    pub async fn connect(db_url: &str) -> Result<Self, RecordError> {
        info!("Connecting to SQLite database: {}", db_url);

        let db = Database::connect(db_url)
            .await
            .map_err(RecordError::Database)?;

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);

        // 테이블 생성 (IF NOT EXISTS)
        let mut stmt = schema.create_table_from_entity(trades::Entity);
        stmt.if_not_exists();
        db.execute(backend.build(&stmt))
            .await
            .map_err(RecordError::Database)?;

        let mut stmt = schema.create_table_from_entity(user_profiles::Entity);
        stmt.if_not_exists();
        db.execute(backend.build(&stmt))
            .await
            .map_err(RecordError::Database)?;

        let mut stmt = schema.create_table_from_entity(api_settings::Entity);
        stmt.if_not_exists();
        db.execute(backend.build(&stmt))
            .await
            .map_err(RecordError::Database)?;

        let mut stmt = schema.create_table_from_entity(test_runs::Entity);
        stmt.if_not_exists();
        db.execute(backend.build(&stmt))
            .await
            .map_err(RecordError::Database)?;

        // 인덱스 생성
        let mut owner_idx = Index::create()
            .name("idx_trades_owner_profile")
            .table(trades::Entity)
            .col(trades::Column::Owner)
            .col(trades::Column::ProfileId)
            .to_owned();
        owner_idx.if_not_exists();

        let mut external_idx = Index::create()
            .name("idx_trades_external_id")
            .table(trades::Entity)
            .col(trades::Column::Owner)
            .col(trades::Column::ExternalId)
            .to_owned();
        external_idx.if_not_exists();

        let mut profile_owner_idx = Index::create()
            .name("idx_user_profiles_owner")
            .table(user_profiles::Entity)
            .col(user_profiles::Column::Owner)
            .to_owned();
        profile_owner_idx.if_not_exists();

        let mut test_run_idx = Index::create()
            .name("idx_test_runs_lookup")
            .table(test_runs::Entity)
            .col(test_runs::Column::Owner)
            .col(test_runs::Column::ProfileId)
            .col(test_runs::Column::TestRunId)
            .to_owned();
        test_run_idx.if_not_exists();

        for idx in [owner_idx, external_idx, profile_owner_idx, test_run_idx] {
            if let Err(e) = db.execute(backend.build(&idx)).await {
                tracing::debug!("Index creation skipped: {}", e);
            }
        }

        info!("Journal tables initialized");

        Ok(Self { db })
    }
}

/// Trade → ActiveModel 변환 (이력은 여기서만 JSON으로 직렬화)
fn trade_active_model(trade: &Trade) -> Result<trades::ActiveModel, RecordError> {
    Ok(trades::ActiveModel {
        id: Set(trade.id.clone()),
        owner: Set(trade.owner.clone()),
        profile_id: Set(trade.profile_id.clone()),
        external_id: Set(trade.external_id.clone()),
        coin: Set(trade.coin.clone()),
        direction: Set(trade.direction.to_string()),
        entry_price: Set(trade.entry_price),
        original_entry_price: Set(trade.original_entry_price),
        position_size: Set(trade.position_size),
        stop_price: Set(trade.stop_price),
        take_price: Set(trade.take_price),
        close_price: Set(trade.close_price),
        date_open: Set(trade.date_open.to_rfc3339()),
        date_close: Set(trade.date_close.map(|d| d.to_rfc3339())),
        risk_usd: Set(trade.risk_usd),
        risk_percent: Set(trade.risk_percent),
        rr_ratio: Set(trade.rr_ratio),
        pnl_usd: Set(trade.pnl_usd),
        pnl_percent_of_balance: Set(trade.pnl_percent_of_balance),
        r_multiple: Set(trade.r_multiple),
        realized_pnl_usd: Set(trade.realized_pnl_usd),
        adds_history: Set(serde_json::to_string(&trade.adds_history)?),
        partial_closes: Set(serde_json::to_string(&trade.partial_closes)?),
        account_balance_at_entry: Set(trade.account_balance_at_entry),
        test_run_id: Set(trade.test_run_id.clone()),
        import_source: Set(trade.import_source.to_string()),
    })
}

/// 필터를 쿼리에 적용
fn apply_filter(
    mut query: sea_orm::Select<trades::Entity>,
    filter: &TradeFilter,
) -> sea_orm::Select<trades::Entity> {
    query = query.filter(trades::Column::Owner.eq(filter.owner.as_str()));
    if let Some(profile_id) = &filter.profile_id {
        query = query.filter(trades::Column::ProfileId.eq(profile_id.as_str()));
    }
    if let Some(test_run_id) = &filter.test_run_id {
        query = query.filter(trades::Column::TestRunId.eq(test_run_id.as_str()));
    }
    if filter.open_only {
        query = query.filter(trades::Column::ClosePrice.is_null());
    }
    query
}

#[async_trait]
impl TradeStore for SqliteJournalStore {
    async fn create(&self, trade: &Trade) -> Result<(), RecordError> {
        let model = trade_active_model(trade)?;
        trades::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn bulk_create(&self, items: &[Trade]) -> Result<(), RecordError> {
        if items.is_empty() {
            return Ok(());
        }

        let models: Vec<trades::ActiveModel> = items
            .iter()
            .map(trade_active_model)
            .collect::<Result<_, _>>()?;

        trades::Entity::insert_many(models)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn update(&self, trade: &Trade) -> Result<(), RecordError> {
        let model = trade_active_model(trade)?;
        trades::Entity::update(model)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn delete_by_ids(&self, owner: &str, ids: &[String]) -> Result<u64, RecordError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = trades::Entity::delete_many()
            .filter(trades::Column::Owner.eq(owner))
            .filter(trades::Column::Id.is_in(ids.iter().map(String::as_str)))
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;

        Ok(result.rows_affected)
    }

    async fn find_by_id(&self, owner: &str, id: &str) -> Result<Option<Trade>, RecordError> {
        let model = trades::Entity::find_by_id(id)
            .filter(trades::Column::Owner.eq(owner))
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?;

        match model {
            Some(m) => Ok(Some(m.try_into()?)),
            None => Ok(None),
        }
    }

    async fn find_by_external_id(
        &self,
        owner: &str,
        external_id: &str,
    ) -> Result<Option<Trade>, RecordError> {
        let model = trades::Entity::find()
            .filter(trades::Column::Owner.eq(owner))
            .filter(trades::Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?;

        match model {
            Some(m) => Ok(Some(m.try_into()?)),
            None => Ok(None),
        }
    }

    async fn filter(
        &self,
        filter: &TradeFilter,
        limit: Option<u64>,
        skip: Option<u64>,
    ) -> Result<Vec<Trade>, RecordError> {
        let mut query = apply_filter(trades::Entity::find(), filter)
            .order_by_desc(trades::Column::DateOpen);

        if let Some(limit_val) = limit {
            query = query.limit(limit_val);
        }
        if let Some(skip_val) = skip {
            query = query.offset(skip_val);
        }

        let models = query.all(&self.db).await.map_err(RecordError::Database)?;
        models.into_iter().map(|m| m.try_into()).collect()
    }

    async fn count(&self, filter: &TradeFilter) -> Result<u64, RecordError> {
        apply_filter(trades::Entity::find(), filter)
            .count(&self.db)
            .await
            .map_err(RecordError::Database)
    }

    async fn collect_ids(&self, filter: &TradeFilter, cap: u64) -> Result<Vec<String>, RecordError> {
        apply_filter(trades::Entity::find(), filter)
            .select_only()
            .column(trades::Column::Id)
            .limit(cap)
            .into_tuple::<String>()
            .all(&self.db)
            .await
            .map_err(RecordError::Database)
    }
}

#[async_trait]
impl ProfileStore for SqliteJournalStore {
    async fn create_profile(&self, profile: &UserProfile) -> Result<(), RecordError> {
        let model = user_profiles::ActiveModel {
            id: Set(profile.id.clone()),
            owner: Set(profile.owner.clone()),
            is_active: Set(profile.is_active),
            profile_name: Set(profile.profile_name.clone()),
            starting_balance: Set(profile.starting_balance),
            updated_date: Set(profile.updated_date.to_rfc3339()),
        };

        user_profiles::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn update_profile(&self, profile: &UserProfile) -> Result<(), RecordError> {
        let model = user_profiles::ActiveModel {
            id: Set(profile.id.clone()),
            owner: Set(profile.owner.clone()),
            is_active: Set(profile.is_active),
            profile_name: Set(profile.profile_name.clone()),
            starting_balance: Set(profile.starting_balance),
            updated_date: Set(profile.updated_date.to_rfc3339()),
        };

        user_profiles::Entity::update(model)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn find_profile(&self, id: &str) -> Result<Option<UserProfile>, RecordError> {
        let model = user_profiles::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?;

        match model {
            Some(m) => Ok(Some(m.try_into()?)),
            None => Ok(None),
        }
    }

    async fn find_profiles_by_owner(&self, owner: &str) -> Result<Vec<UserProfile>, RecordError> {
        let models = user_profiles::Entity::find()
            .filter(user_profiles::Column::Owner.eq(owner))
            .order_by_desc(user_profiles::Column::UpdatedDate)
            .all(&self.db)
            .await
            .map_err(RecordError::Database)?;

        models.into_iter().map(|m| m.try_into()).collect()
    }
}

#[async_trait]
impl SettingsStore for SqliteJournalStore {
    async fn find_settings(&self, owner: &str) -> Result<Option<ApiSettings>, RecordError> {
        let model = api_settings::Entity::find_by_id(owner)
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?;

        match model {
            Some(m) => Ok(Some(m.try_into()?)),
            None => Ok(None),
        }
    }

    async fn upsert_settings(&self, settings: &ApiSettings) -> Result<(), RecordError> {
        let model = api_settings::ActiveModel {
            owner: Set(settings.owner.clone()),
            api_key: Set(settings.api_key.clone()),
            api_secret: Set(settings.api_secret.clone()),
            bybit_sync_initialized: Set(settings.bybit_sync_initialized),
            closed_baseline_ms: Set(settings.closed_baseline_ms),
            exec_baseline_ms: Set(settings.exec_baseline_ms),
            last_sync: Set(settings.last_sync.map(|d| d.to_rfc3339())),
        };

        let exists = api_settings::Entity::find_by_id(settings.owner.as_str())
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?
            .is_some();

        if exists {
            api_settings::Entity::update(model)
                .exec(&self.db)
                .await
                .map_err(RecordError::Database)?;
        } else {
            api_settings::Entity::insert(model)
                .exec(&self.db)
                .await
                .map_err(RecordError::Database)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TestRunStore for SqliteJournalStore {
    async fn create_test_run(&self, run: &TestRun) -> Result<(), RecordError> {
        let model = test_runs::ActiveModel {
            test_run_id: Set(run.test_run_id.clone()),
            profile_id: Set(run.profile_id.clone()),
            owner: Set(run.owner.clone()),
            count: Set(run.count as i64),
            seed: Set(run.seed as i64),
            mode: Set(run.mode.clone()),
            created_at: Set(run.created_at.to_rfc3339()),
            ..Default::default()
        };

        test_runs::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(RecordError::Database)?;
        Ok(())
    }

    async fn find_test_run(
        &self,
        owner: &str,
        profile_id: &str,
        test_run_id: &str,
    ) -> Result<Option<TestRun>, RecordError> {
        let model = test_runs::Entity::find()
            .filter(test_runs::Column::Owner.eq(owner))
            .filter(test_runs::Column::ProfileId.eq(profile_id))
            .filter(test_runs::Column::TestRunId.eq(test_run_id))
            .one(&self.db)
            .await
            .map_err(RecordError::Database)?;

        match model {
            Some(m) => Ok(Some(m.try_into()?)),
            None => Ok(None),
        }
    }
}
