use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use exchanges::{BybitClient, BybitClosedPnl, BybitPosition, ClosedPnlPage, ExecutionPage};
use interface::{CoreError, Direction, ExchangeError, ImportSource};

use crate::metrics;
use crate::record::{ApiSettings, JournalStore, SettingsStore, Trade, TradeStore};

/// 청산 손익 페이지네이션 상한 (비정상 원격 응답으로부터 지연 시간 상한 보장)
const MAX_CLOSED_PAGES: usize = 50;

/// 체결 내역 페이지네이션 상한
const MAX_EXEC_PAGES: usize = 10;

/// 동기화 서비스가 소비하는 Bybit 연산 집합
/// 테스트에서 목 구현으로 대체할 수 있도록 트레이트로 분리한다.
#[async_trait]
pub trait BybitApi: Send + Sync {
    async fn get_server_time(&self) -> Result<i64, ExchangeError>;
    async fn get_wallet_balance(&self) -> Result<f64, ExchangeError>;
    async fn get_positions(&self) -> Result<Vec<BybitPosition>, ExchangeError>;
    async fn get_executions(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ExecutionPage, ExchangeError>;
    async fn get_closed_pnl(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ClosedPnlPage, ExchangeError>;
}

#[async_trait]
impl BybitApi for BybitClient {
    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        BybitClient::get_server_time(self).await
    }

    async fn get_wallet_balance(&self) -> Result<f64, ExchangeError> {
        BybitClient::get_wallet_balance(self).await
    }

    async fn get_positions(&self) -> Result<Vec<BybitPosition>, ExchangeError> {
        BybitClient::get_positions(self).await
    }

    async fn get_executions(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ExecutionPage, ExchangeError> {
        BybitClient::get_executions(self, start_time_ms, cursor).await
    }

    async fn get_closed_pnl(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ClosedPnlPage, ExchangeError> {
        BybitClient::get_closed_pnl(self, start_time_ms, cursor).await
    }
}

/// 동기화 섹션별 에러 (전체 호출을 중단시키지 않는다)
#[derive(Debug, Clone, Serialize)]
pub struct SyncSectionError {
    pub section: String,
    pub error_code: String,
    pub message: String,
}

/// 동기화 1회의 결과 보고
/// 섹션별 카운트와 섹션별 에러를 함께 담는다.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncReport {
    pub initialized: bool,
    pub balance: Option<f64>,
    pub open_upserted: usize,
    pub executions_seen: usize,
    pub closed_upserted: usize,
    pub closed_baseline_ms: i64,
    pub exec_baseline_ms: i64,
    pub errors: Vec<SyncSectionError>,
}

impl SyncReport {
    fn push_error(&mut self, section: &str, e: &ExchangeError) {
        warn!(section, error = %e, "sync section failed");
        self.errors.push(SyncSectionError {
            section: section.to_string(),
            error_code: e.error_code().to_string(),
            message: e.to_string(),
        });
    }
}

/// 원격 브로커의 열린/청산된 포지션을 로컬 레코드로 증분 미러링하는 서비스.
///
/// 업서트는 external_id 결정적 키 기반이라 재시도/재동기화가 여러 번
/// 전달되어도 저장 효과는 정확히 한 번이다. 같은 계정에 대한 동시
/// 동기화 호출은 커서 갱신을 잃을 수 있다 — 호출 측에서 직렬화해야 한다.
pub struct ExchangeSyncService {
    store: Arc<dyn JournalStore>,
}

impl ExchangeSyncService {
    pub fn new(store: Arc<dyn JournalStore>) -> Self {
        Self { store }
    }

    /// 동기화 실행. `bybit_sync_initialized`에 따라 초기화/증분 모드를 고른다.
    pub async fn sync(
        &self,
        api: &dyn BybitApi,
        owner: &str,
        profile_id: &str,
    ) -> Result<SyncReport, CoreError> {
        let mut settings = self
            .store
            .find_settings(owner)
            .await?
            .ok_or_else(|| CoreError::Validation("exchange credentials not configured".to_string()))?;

        let mut report = SyncReport::default();

        // 잔고 조회 실패는 치명적이지 않다 — 잔고 없이 진행
        match api.get_wallet_balance().await {
            Ok(balance) => report.balance = Some(balance),
            Err(e) => report.push_error("balance", &e),
        }

        if !settings.bybit_sync_initialized {
            self.initialize(api, owner, profile_id, &mut settings, &mut report)
                .await?;
        } else {
            self.incremental(api, owner, profile_id, &mut settings, &mut report)
                .await?;
        }

        settings.last_sync = Some(Utc::now());
        self.store.upsert_settings(&settings).await?;

        report.initialized = settings.bybit_sync_initialized;
        report.closed_baseline_ms = settings.closed_baseline_ms;
        report.exec_baseline_ms = settings.exec_baseline_ms;
        Ok(report)
    }

    /// 초기화 모드: 현재 열린 포지션만 가져오고 (과거 백필 없음),
    /// 두 커서를 모두 서버 시간으로 맞춘 뒤 초기화 완료로 표시한다.
    async fn initialize(
        &self,
        api: &dyn BybitApi,
        owner: &str,
        profile_id: &str,
        settings: &mut ApiSettings,
        report: &mut SyncReport,
    ) -> Result<(), CoreError> {
        // 서버 시간 조회, 실패하면 로컬 시간 폴백
        let server_time_ms = match api.get_server_time().await {
            Ok(ms) => ms,
            Err(e) => {
                warn!(error = %e, "server time fetch failed, falling back to local clock");
                Utc::now().timestamp_millis()
            }
        };

        match api.get_positions().await {
            Ok(positions) => {
                for position in &positions {
                    self.upsert_open_position(owner, profile_id, position, report.balance)
                        .await?;
                    report.open_upserted += 1;
                }

                // 포지션 가져오기가 성공했을 때만 초기화 완료로 표시한다.
                // 실패 시 다음 호출이 초기화를 다시 시도한다.
                settings.closed_baseline_ms = server_time_ms;
                settings.exec_baseline_ms = server_time_ms;
                settings.bybit_sync_initialized = true;
                info!(owner, server_time_ms, "bybit sync initialized");
            }
            Err(e) => report.push_error("positions", &e),
        }

        Ok(())
    }

    /// 증분 모드: 열린 포지션 스냅샷 재업서트, 체결 내역 커서 전진,
    /// 청산 손익 페이지네이션 업서트. 각 섹션의 실패는 독립적으로 격리된다.
    async fn incremental(
        &self,
        api: &dyn BybitApi,
        owner: &str,
        profile_id: &str,
        settings: &mut ApiSettings,
        report: &mut SyncReport,
    ) -> Result<(), CoreError> {
        // (a) 현재 열린 포지션 전체 재업서트 (델타가 아니라 스냅샷 교체)
        match api.get_positions().await {
            Ok(positions) => {
                for position in &positions {
                    self.upsert_open_position(owner, profile_id, position, report.balance)
                        .await?;
                    report.open_upserted += 1;
                }
            }
            Err(e) => report.push_error("positions", &e),
        }

        // (b) 체결 내역: 커서 전진용 북키핑만 수행한다
        match self.fetch_executions_max_ts(api, settings.exec_baseline_ms, report).await {
            Ok(Some(max_ts)) => {
                // 커서는 단조 비감소
                if max_ts > settings.exec_baseline_ms {
                    settings.exec_baseline_ms = max_ts;
                }
            }
            Ok(None) => {}
            Err(e) => report.push_error("executions", &e),
        }

        // (c) 청산 손익 페이지네이션 업서트
        match self
            .sync_closed_pnl(api, owner, profile_id, settings.closed_baseline_ms, report)
            .await
        {
            Ok(Some(max_ts)) => {
                if max_ts > settings.closed_baseline_ms {
                    settings.closed_baseline_ms = max_ts;
                }
            }
            Ok(None) => {}
            Err(SyncStepError::Exchange(e)) => report.push_error("closed_pnl", &e),
            Err(SyncStepError::Storage(e)) => return Err(e),
        }

        Ok(())
    }

    /// 체결 내역을 페이지 상한까지 읽고 최대 타임스탬프를 반환
    async fn fetch_executions_max_ts(
        &self,
        api: &dyn BybitApi,
        start_ms: i64,
        report: &mut SyncReport,
    ) -> Result<Option<i64>, ExchangeError> {
        let mut cursor: Option<String> = None;
        let mut max_ts: Option<i64> = None;

        for _ in 0..MAX_EXEC_PAGES {
            let page = api.get_executions(start_ms, cursor.as_deref()).await?;
            if page.list.is_empty() {
                break;
            }

            for execution in &page.list {
                report.executions_seen += 1;
                let ts = execution.exec_ms();
                if ts > max_ts.unwrap_or(i64::MIN) {
                    max_ts = Some(ts);
                }
            }

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = Some(page.next_page_cursor);
        }

        Ok(max_ts)
    }

    /// 청산 손익 페이지를 순회하며 업서트하고 최대 타임스탬프를 반환
    /// 페이지 순회가 도중에 실패하면 커서는 전진하지 않는다 (업서트 덕분에
    /// 다음 호출이 같은 레코드를 다시 받아도 중복은 생기지 않는다).
    async fn sync_closed_pnl(
        &self,
        api: &dyn BybitApi,
        owner: &str,
        profile_id: &str,
        start_ms: i64,
        report: &mut SyncReport,
    ) -> Result<Option<i64>, SyncStepError> {
        let mut cursor: Option<String> = None;
        let mut max_ts: Option<i64> = None;

        for _ in 0..MAX_CLOSED_PAGES {
            let page = api
                .get_closed_pnl(start_ms, cursor.as_deref())
                .await
                .map_err(SyncStepError::Exchange)?;

            if page.list.is_empty() {
                break;
            }

            for record in &page.list {
                self.upsert_closed_record(owner, profile_id, record, report.balance)
                    .await
                    .map_err(SyncStepError::Storage)?;
                report.closed_upserted += 1;

                let ts = record.updated_ms();
                if ts > max_ts.unwrap_or(i64::MIN) {
                    max_ts = Some(ts);
                }
            }

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = Some(page.next_page_cursor);
        }

        Ok(max_ts)
    }

    /// 열린 포지션 업서트: external_id로 조회해서 있으면 갱신, 없으면 생성
    async fn upsert_open_position(
        &self,
        owner: &str,
        profile_id: &str,
        position: &BybitPosition,
        balance: Option<f64>,
    ) -> Result<(), CoreError> {
        let external_id = format!(
            "BYBIT:OPEN:{}:{}:{}",
            position.symbol, position.side, position.position_idx
        );

        let direction = match position.side.as_str() {
            "Buy" => Direction::Long,
            _ => Direction::Short,
        };

        let entry_price = position.avg_price_f64();
        let size_usd = position.notional_usd();
        let stop_price = position.stop_loss_f64();
        let take_price = position.take_profit_f64();
        let risk_usd = metrics::risk(entry_price, stop_price, size_usd);

        match self.store.find_by_external_id(owner, &external_id).await? {
            Some(mut existing) => {
                // 스냅샷 교체: 가격/수량/스탑/테이크만 갱신, 최초 진입 정보는 유지
                existing.entry_price = entry_price;
                existing.position_size = size_usd;
                existing.stop_price = stop_price;
                existing.take_price = take_price;
                existing.risk_usd = risk_usd;
                existing.risk_percent = balance
                    .and_then(|b| metrics::risk_percent(risk_usd, b))
                    .or(existing.risk_percent);
                self.store.update(&existing).await?;
            }
            None => {
                let date_open = DateTime::<Utc>::from_timestamp_millis(position.created_ms())
                    .unwrap_or_else(Utc::now);
                let trade = Trade {
                    id: Uuid::new_v4().to_string(),
                    owner: owner.to_string(),
                    profile_id: profile_id.to_string(),
                    external_id: Some(external_id),
                    coin: position.symbol.clone(),
                    direction,
                    entry_price,
                    original_entry_price: entry_price,
                    position_size: size_usd,
                    stop_price,
                    take_price,
                    close_price: None,
                    date_open,
                    date_close: None,
                    risk_usd,
                    risk_percent: balance.and_then(|b| metrics::risk_percent(risk_usd, b)),
                    rr_ratio: metrics::rr(entry_price, take_price, stop_price),
                    pnl_usd: 0.0,
                    pnl_percent_of_balance: 0.0,
                    r_multiple: None,
                    realized_pnl_usd: 0.0,
                    adds_history: Vec::new(),
                    partial_closes: Vec::new(),
                    account_balance_at_entry: balance,
                    test_run_id: None,
                    import_source: ImportSource::BybitSync,
                };
                self.store.create(&trade).await?;
            }
        }

        Ok(())
    }

    /// 청산 손익 레코드 업서트
    /// closed-pnl의 side는 *청산 주문*의 방향이므로 포지션 방향은 그 반대다.
    async fn upsert_closed_record(
        &self,
        owner: &str,
        profile_id: &str,
        record: &BybitClosedPnl,
        balance: Option<f64>,
    ) -> Result<(), CoreError> {
        let external_id = format!(
            "BYBIT:CLOSED:{}:{}:{}",
            record.symbol,
            record.side,
            record.updated_ms()
        );

        let direction = match record.side.as_str() {
            "Sell" => Direction::Long,
            _ => Direction::Short,
        };

        let entry_price = record.entry_price();
        let exit_price = record.exit_price();
        let pnl_usd = record.pnl_usd();
        let size_usd = record.notional_usd();

        let date_open = DateTime::<Utc>::from_timestamp_millis(record.created_ms())
            .unwrap_or_else(Utc::now);
        let date_close = DateTime::<Utc>::from_timestamp_millis(record.updated_ms())
            .unwrap_or_else(Utc::now);

        match self.store.find_by_external_id(owner, &external_id).await? {
            Some(mut existing) => {
                existing.entry_price = entry_price;
                existing.close_price = Some(exit_price);
                existing.position_size = size_usd;
                existing.pnl_usd = pnl_usd;
                existing.realized_pnl_usd = pnl_usd;
                existing.date_close = Some(date_close);
                self.store.update(&existing).await?;
            }
            None => {
                let trade = Trade {
                    id: Uuid::new_v4().to_string(),
                    owner: owner.to_string(),
                    profile_id: profile_id.to_string(),
                    external_id: Some(external_id),
                    coin: record.symbol.clone(),
                    direction,
                    entry_price,
                    original_entry_price: entry_price,
                    position_size: size_usd,
                    stop_price: None,
                    take_price: None,
                    close_price: Some(exit_price),
                    date_open,
                    date_close: Some(date_close),
                    // 스탑 정보가 없으므로 리스크는 미정의 (0이 아니다)
                    risk_usd: None,
                    risk_percent: None,
                    rr_ratio: None,
                    pnl_usd,
                    pnl_percent_of_balance: balance
                        .filter(|b| *b > 0.0)
                        .map(|b| pnl_usd / b * 100.0)
                        .unwrap_or(0.0),
                    r_multiple: None,
                    realized_pnl_usd: pnl_usd,
                    adds_history: Vec::new(),
                    partial_closes: Vec::new(),
                    account_balance_at_entry: balance,
                    test_run_id: None,
                    import_source: ImportSource::BybitSync,
                };
                self.store.create(&trade).await?;
            }
        }

        Ok(())
    }
}

/// 청산 손익 단계 내부 에러: 거래소 에러는 섹션에 격리하고
/// 저장소 에러는 호출 전체를 중단시킨다.
enum SyncStepError {
    Exchange(ExchangeError),
    Storage(CoreError),
}

/// 기존 ApiSettings가 없을 때 쓰는 기본값
pub fn default_settings(owner: &str, api_key: &str, api_secret: &str) -> ApiSettings {
    ApiSettings {
        owner: owner.to_string(),
        api_key: api_key.to_string(),
        api_secret: api_secret.to_string(),
        bybit_sync_initialized: false,
        closed_baseline_ms: 0,
        exec_baseline_ms: 0,
        last_sync: None,
    }
}

/// 설정에서 클라이언트 구성
pub fn client_from_settings(settings: &ApiSettings) -> BybitClient {
    BybitClient::new(settings.api_key.clone(), settings.api_secret.clone())
}
