use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use interface::{CoreError, Direction, Fill, ImportSource, PartialClose};

use crate::ledger::PositionLedger;
use crate::metrics;
use crate::profile::{ProfileIntegrityManager, DEFAULT_STARTING_BALANCE};
use crate::record::{JournalStore, ProfileStore, Trade, TradeFilter, TradeStore};

/// 거래 생성 요청
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTradeRequest {
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub position_size: f64,
    pub stop_price: Option<f64>,
    pub take_price: Option<f64>,
    pub date_open: Option<DateTime<Utc>>,
}

/// 추가 진입 요청
#[derive(Debug, Clone, Deserialize)]
pub struct AddFillRequest {
    pub price: f64,
    pub size_usd: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// 부분 청산 요청 — percent는 *잔여* 수량 기준
#[derive(Debug, Clone, Deserialize)]
pub struct PartialCloseRequest {
    pub percent: f64,
    pub price: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// 최종 청산 요청
#[derive(Debug, Clone, Deserialize)]
pub struct CloseTradeRequest {
    pub close_price: f64,
    pub date_close: Option<DateTime<Utc>>,
}

/// 거래 수명주기 서비스: 생성 → 추가 진입/부분 청산 → 최종 청산.
///
/// 파생 지표(리스크, 손익비, R-배수)는 저장 시점에 계산해 레코드에
/// 스냅샷으로 남긴다 — 읽기 경로는 재계산하지 않는다.
pub struct TradeService {
    store: Arc<dyn JournalStore>,
    profiles: ProfileIntegrityManager,
}

impl TradeService {
    pub fn new(store: Arc<dyn JournalStore>, profiles: ProfileIntegrityManager) -> Self {
        Self { store, profiles }
    }

    /// 새 거래 생성. 활성 프로필에 귀속되며, 진입 시점 잔고가 스냅샷된다.
    pub async fn create(&self, owner: &str, request: CreateTradeRequest) -> Result<Trade, CoreError> {
        if request.coin.trim().is_empty() {
            return Err(CoreError::Validation("coin is required".to_string()));
        }
        if request.entry_price <= 0.0 || !request.entry_price.is_finite() {
            return Err(CoreError::Validation(
                "entry_price must be positive".to_string(),
            ));
        }
        if request.position_size <= 0.0 || !request.position_size.is_finite() {
            return Err(CoreError::Validation(
                "position_size must be positive".to_string(),
            ));
        }

        // 첫 거래 기록이 첫 로그인일 수 있다 — 프로필이 없으면 기본 프로필을
        // 자동 생성한다 (프로필 조회 핸들러와 같은 규칙)
        let profile = self
            .profiles
            .ensure_default_profile(owner, DEFAULT_STARTING_BALANCE)
            .await?;
        let balance = self.account_balance(owner, &profile.id).await?;

        let risk_usd = metrics::risk(request.entry_price, request.stop_price, request.position_size);
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            profile_id: profile.id,
            external_id: None,
            coin: request.coin.trim().to_uppercase(),
            direction: request.direction,
            entry_price: request.entry_price,
            original_entry_price: request.entry_price,
            position_size: request.position_size,
            stop_price: request.stop_price,
            take_price: request.take_price,
            close_price: None,
            date_open: request.date_open.unwrap_or_else(Utc::now),
            date_close: None,
            risk_usd,
            risk_percent: metrics::risk_percent(risk_usd, balance),
            rr_ratio: metrics::rr(request.entry_price, request.take_price, request.stop_price),
            pnl_usd: 0.0,
            pnl_percent_of_balance: 0.0,
            r_multiple: None,
            realized_pnl_usd: 0.0,
            adds_history: Vec::new(),
            partial_closes: Vec::new(),
            account_balance_at_entry: Some(balance),
            test_run_id: None,
            import_source: ImportSource::Manual,
        };

        self.store.create(&trade).await?;
        info!(owner, trade_id = %trade.id, coin = %trade.coin, "trade created");
        Ok(trade)
    }

    /// 추가 진입: 이력에 기록하고 평균 진입가와 파생 지표를 재계산한다.
    pub async fn add_to_position(
        &self,
        owner: &str,
        trade_id: &str,
        request: AddFillRequest,
    ) -> Result<Trade, CoreError> {
        if request.price <= 0.0 || request.size_usd <= 0.0 {
            return Err(CoreError::Validation(
                "price and size_usd must be positive".to_string(),
            ));
        }

        let mut trade = self.find_open(owner, trade_id).await?;
        let fill = Fill {
            price: request.price,
            size_usd: request.size_usd,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
        };

        // 현재 평균 진입가/잔여 명목을 진입으로 삼아 새 체결 하나만 재생한다
        // — 평균 진입가 계산은 이렇게 합성해도 전체 이력 재생과 같다
        let ledger = PositionLedger::replay(
            trade.direction,
            trade.entry_price,
            trade.position_size,
            std::slice::from_ref(&fill),
            &[],
        );
        trade.entry_price = ledger
            .avg_entry()
            .ok_or_else(|| CoreError::Validation("position has no remaining size".to_string()))?;
        trade.position_size = ledger.remaining_size_usd();
        trade.adds_history.push(fill);

        self.refresh_derived_metrics(&mut trade);
        self.store.update(&trade).await?;
        Ok(trade)
    }

    /// 부분 청산: 잔여 수량의 percent를 price에 실현한다.
    /// 평균 진입가는 변하지 않고 잔여 명목만 줄어든다.
    pub async fn partial_close(
        &self,
        owner: &str,
        trade_id: &str,
        request: PartialCloseRequest,
    ) -> Result<Trade, CoreError> {
        if !(0.0..100.0).contains(&request.percent) || request.percent <= 0.0 {
            return Err(CoreError::Validation(
                "percent must be in (0, 100); use close for a full exit".to_string(),
            ));
        }
        if request.price <= 0.0 || !request.price.is_finite() {
            return Err(CoreError::Validation("price must be positive".to_string()));
        }

        let mut trade = self.find_open(owner, trade_id).await?;

        // 청산 *이전* 잔여 기준으로 이 슬라이스의 손익을 계산한다
        let before = PositionLedger::replay(
            trade.direction,
            trade.entry_price,
            trade.position_size,
            &[],
            &[],
        );
        let slice_pnl = before
            .slice_pnl(request.percent, request.price)
            .ok_or_else(|| CoreError::Validation("position has no remaining size".to_string()))?;

        let partial = PartialClose {
            percent: request.percent,
            price: request.price,
            pnl_usd: slice_pnl,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
        };
        let after = PositionLedger::replay(
            trade.direction,
            trade.entry_price,
            trade.position_size,
            &[],
            std::slice::from_ref(&partial),
        );

        // 부분 청산은 잔여 명목만 줄인다 — 평균 진입가는 불변
        trade.position_size = after.remaining_size_usd();
        trade.realized_pnl_usd += slice_pnl;
        trade.partial_closes.push(partial);

        self.refresh_derived_metrics(&mut trade);
        self.store.update(&trade).await?;
        Ok(trade)
    }

    /// 최종 청산: 잔여 전량을 close_price에 실현하고 레코드를 닫는다.
    /// 총 손익 = Σ(부분 청산 pnl) + 잔여분의 최종 청산 pnl.
    pub async fn close(
        &self,
        owner: &str,
        trade_id: &str,
        request: CloseTradeRequest,
    ) -> Result<Trade, CoreError> {
        if request.close_price <= 0.0 || !request.close_price.is_finite() {
            return Err(CoreError::Validation(
                "close_price must be positive".to_string(),
            ));
        }

        let mut trade = self.find_open(owner, trade_id).await?;
        let final_pnl = metrics::pnl(
            trade.direction,
            trade.entry_price,
            request.close_price,
            trade.position_size,
        )
        .ok_or_else(|| CoreError::Validation("position has no remaining size".to_string()))?;
        // 총 손익 = 이미 실현된 부분 청산 합 + 잔여분의 최종 청산분
        let total_pnl = trade.realized_pnl_usd + final_pnl;

        trade.close_price = Some(request.close_price);
        trade.date_close = Some(request.date_close.unwrap_or_else(Utc::now));
        trade.pnl_usd = total_pnl;
        trade.realized_pnl_usd = total_pnl;
        // R-배수는 진입 시점의 최초 리스크 기준
        trade.r_multiple = metrics::r_multiple(total_pnl, trade.risk_usd);
        trade.pnl_percent_of_balance = trade
            .account_balance_at_entry
            .filter(|b| *b > 0.0)
            .map(|b| total_pnl / b * 100.0)
            .unwrap_or(0.0);

        self.store.update(&trade).await?;
        info!(owner, trade_id = %trade.id, pnl_usd = total_pnl, "trade closed");
        Ok(trade)
    }

    /// 활성 프로필의 거래 목록 (date_open 내림차순)
    pub async fn list(
        &self,
        owner: &str,
        open_only: bool,
        limit: Option<u64>,
        skip: Option<u64>,
    ) -> Result<Vec<Trade>, CoreError> {
        let profile = self.profiles.active_profile(owner).await?;
        let mut filter = TradeFilter::for_owner(owner).profile(&profile.id);
        if open_only {
            filter = filter.open_only();
        }
        Ok(self.store.filter(&filter, limit, skip).await?)
    }

    pub async fn get(&self, owner: &str, trade_id: &str) -> Result<Trade, CoreError> {
        self.store
            .find_by_id(owner, trade_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trade {}", trade_id)))
    }

    pub async fn delete(&self, owner: &str, trade_id: &str) -> Result<(), CoreError> {
        let deleted = self
            .store
            .delete_by_ids(owner, &[trade_id.to_string()])
            .await?;
        if deleted == 0 {
            return Err(CoreError::NotFound(format!("trade {}", trade_id)));
        }
        Ok(())
    }

    async fn find_open(&self, owner: &str, trade_id: &str) -> Result<Trade, CoreError> {
        let trade = self.get(owner, trade_id).await?;
        if !trade.is_open() {
            return Err(CoreError::Validation(format!(
                "trade {} is already closed",
                trade_id
            )));
        }
        Ok(trade)
    }

    /// 현재 평균 진입가 기준으로 손익비 재계산
    ///
    /// risk_usd/risk_percent는 진입 시점 스냅샷이라 여기서 덮어쓰지 않는다.
    /// R-배수의 분모는 최초에 리스크로 건 금액이어야 하는데, 부분 청산 후
    /// 잔여 명목으로 재계산하면 분모가 줄어 R이 부풀려진다.
    fn refresh_derived_metrics(&self, trade: &mut Trade) {
        trade.rr_ratio = metrics::rr(trade.entry_price, trade.take_price, trade.stop_price);
    }

    /// 진입 시점 잔고 = 프로필 시작 잔고 + 해당 프로필의 실현 손익 합계
    async fn account_balance(&self, owner: &str, profile_id: &str) -> Result<f64, CoreError> {
        let profile = self
            .store
            .find_profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {}", profile_id)))?;

        let filter = TradeFilter::for_owner(owner).profile(profile_id);
        let trades = self.store.filter(&filter, None, None).await?;
        let realized: f64 = trades
            .iter()
            .filter(|t| !t.is_open())
            .map(|t| t.pnl_usd)
            .sum();
        Ok(profile.starting_balance + realized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryJournalStore;

    async fn service() -> (TradeService, Arc<MemoryJournalStore>) {
        let store = Arc::new(MemoryJournalStore::new());
        let profiles = ProfileIntegrityManager::new(store.clone());
        profiles
            .ensure_default_profile("user1", 10_000.0)
            .await
            .unwrap();
        (TradeService::new(store.clone(), profiles), store)
    }

    fn create_request(entry: f64, size: f64, stop: Option<f64>) -> CreateTradeRequest {
        CreateTradeRequest {
            coin: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: entry,
            position_size: size,
            stop_price: stop,
            take_price: None,
            date_open: None,
        }
    }

    #[tokio::test]
    async fn test_create_snapshots_risk_and_balance() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, Some(95.0)))
            .await
            .unwrap();

        assert!(trade.is_open());
        assert_eq!(trade.account_balance_at_entry, Some(10_000.0));
        // |100-95|/100·1000 = 50, 50/10000 = 0.5%
        assert!((trade.risk_usd.unwrap() - 50.0).abs() < 1e-9);
        assert!((trade.risk_percent.unwrap() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_create_without_stop_has_undefined_risk() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();
        assert_eq!(trade.risk_usd, None);
        assert_eq!(trade.risk_percent, None);
    }

    #[tokio::test]
    async fn test_add_to_position_recomputes_avg_entry() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();

        let updated = service
            .add_to_position(
                "user1",
                &trade.id,
                AddFillRequest {
                    price: 80.0,
                    size_usd: 500.0,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        // avgEntry = 1500/16.25 ≈ 92.31
        assert!((updated.entry_price - 1500.0 / 16.25).abs() < 1e-9);
        assert!((updated.position_size - 1500.0).abs() < 1e-9);
        // 최초 진입가는 보존된다
        assert_eq!(updated.original_entry_price, 100.0);
    }

    #[tokio::test]
    async fn test_partial_close_realizes_slice_pnl() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();

        let updated = service
            .partial_close(
                "user1",
                &trade.id,
                PartialCloseRequest {
                    percent: 50.0,
                    price: 110.0,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        // 500·(110/100 − 1) = 50
        assert!((updated.realized_pnl_usd - 50.0).abs() < 1e-9);
        assert!((updated.position_size - 500.0).abs() < 1e-9);
        assert!(updated.is_open());
    }

    #[tokio::test]
    async fn test_close_sums_partials_and_final_slice() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, Some(95.0)))
            .await
            .unwrap();

        service
            .partial_close(
                "user1",
                &trade.id,
                PartialCloseRequest {
                    percent: 50.0,
                    price: 110.0,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        let closed = service
            .close(
                "user1",
                &trade.id,
                CloseTradeRequest {
                    close_price: 120.0,
                    date_close: None,
                },
            )
            .await
            .unwrap();

        // 부분 50 + 잔여 500·(120/100 − 1) = 150
        assert!(!closed.is_open());
        assert!((closed.pnl_usd - 150.0).abs() < 1e-9);
        // 최초 리스크 50 ⇒ R = 3
        assert!((closed.r_multiple.unwrap() - 3.0).abs() < 1e-9);
        // 10000 잔고 대비 1.5%
        assert!((closed.pnl_percent_of_balance - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_close_preserves_entry_risk_snapshot() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, Some(95.0)))
            .await
            .unwrap();
        assert!((trade.risk_usd.unwrap() - 50.0).abs() < 1e-9);

        let updated = service
            .partial_close(
                "user1",
                &trade.id,
                PartialCloseRequest {
                    percent: 50.0,
                    price: 110.0,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        // 잔여 명목이 절반이 돼도 리스크 스냅샷은 그대로다 —
        // 잔여 기준으로 다시 계산하면 R-배수의 분모가 반으로 줄어든다
        assert!((updated.risk_usd.unwrap() - 50.0).abs() < 1e-9);
        assert!((updated.risk_percent.unwrap() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_create_auto_provisions_default_profile() {
        // 사전 프로필 없이 바로 거래 생성 — 첫 요청이 거래 기록일 수 있다
        let store = Arc::new(MemoryJournalStore::new());
        let profiles = ProfileIntegrityManager::new(store.clone());
        let service = TradeService::new(store.clone(), profiles);

        let trade = service
            .create("fresh-user", create_request(100.0, 1000.0, None))
            .await
            .unwrap();
        assert_eq!(trade.account_balance_at_entry, Some(10_000.0));

        let profiles = store.find_profiles_by_owner("fresh-user").await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].is_active);
        assert_eq!(profiles[0].profile_name, "Default");
        assert_eq!(trade.profile_id, profiles[0].id);
    }

    #[tokio::test]
    async fn test_close_is_rejected_twice() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();

        service
            .close(
                "user1",
                &trade.id,
                CloseTradeRequest {
                    close_price: 110.0,
                    date_close: None,
                },
            )
            .await
            .unwrap();

        let err = service
            .close(
                "user1",
                &trade.id,
                CloseTradeRequest {
                    close_price: 120.0,
                    date_close: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_balance_accumulates_realized_pnl() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();
        service
            .close(
                "user1",
                &trade.id,
                CloseTradeRequest {
                    close_price: 110.0,
                    date_close: None,
                },
            )
            .await
            .unwrap();

        // 다음 거래의 잔고 스냅샷에는 +100이 반영된다
        let next = service
            .create("user1", create_request(200.0, 500.0, None))
            .await
            .unwrap();
        assert_eq!(next.account_balance_at_entry, Some(10_100.0));
    }

    #[tokio::test]
    async fn test_owner_scoping_on_lookup() {
        let (service, _) = service().await;
        let trade = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();

        let err = service.get("user2", &trade.id).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err = service.delete("user2", &trade.id).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_open_only() {
        let (service, _) = service().await;
        let a = service
            .create("user1", create_request(100.0, 1000.0, None))
            .await
            .unwrap();
        service
            .create("user1", create_request(200.0, 500.0, None))
            .await
            .unwrap();
        service
            .close(
                "user1",
                &a.id,
                CloseTradeRequest {
                    close_price: 110.0,
                    date_close: None,
                },
            )
            .await
            .unwrap();

        let open = service.list("user1", true, None, None).await.unwrap();
        assert_eq!(open.len(), 1);
        let all = service.list("user1", false, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
