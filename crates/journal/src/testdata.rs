use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use interface::{CoreError, Direction, ImportSource};

use crate::metrics;
use crate::record::{JournalStore, TestRun, TestRunStore, Trade, TradeFilter, TradeStore};

/// 생성 1회 최대 개수
const GENERATE_CAP: u64 = 1000;

/// 삽입/삭제 배치 크기
const BATCH_SIZE: usize = 50;

/// 레이트 리밋 보호용 배치 간 대기
const BATCH_DELAY_MS: u64 = 100;

/// 일괄 삭제용 id 수집 상한
const ID_COLLECT_CAP: u64 = 10_000;

/// 좁은 PRNG 인터페이스: 시드를 넣으면 [0,1) 실수 스트림이 나온다.
/// 동일한 (seed, params)는 항상 동일한 출력 집합을 재현한다.
/// splitmix64 기반.
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// [0, 1) 균등 분포
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// [lo, hi) 균등 분포
    pub fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// 확률 p로 true
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// 슬라이스에서 하나 선택
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let index = (self.next_f64() * items.len() as f64) as usize;
        &items[index.min(items.len() - 1)]
    }
}

/// 생성 요청
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub owner: String,
    pub profile_id: String,
    pub count: u64,
    pub seed: u64,
    /// "mixed", "winners", "losers"
    pub mode: String,
    /// 없으면 새로 발급된다. 재시도 멱등성을 원하면 호출 측이 지정해야 한다.
    pub test_run_id: Option<String>,
}

/// 생성 결과 보고
/// 멱등 no-op이면 inserted == 0이고 verified는 기존 행 수다.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub test_run_id: String,
    pub requested: u64,
    pub generated: u64,
    pub inserted: u64,
    pub verified: u64,
    pub already_existed: bool,
}

/// 삭제 요청. owner와 profile_id는 항상 필수 — 스코프 없는 삭제는 불가능하다.
#[derive(Debug, Clone)]
pub struct WipeRequest {
    pub owner: String,
    pub profile_id: String,
    /// 지정하면 해당 run의 행만 삭제
    pub test_run_id: Option<String>,
}

/// 결정적·멱등적 테스트 데이터 생성기.
///
/// 같은 불변식을 검증하는 데 쓰이므로 생성/삭제의 불변식 위반은
/// 절대 삼켜지지 않는다 — 즉시 중단하고 에러를 올린다.
pub struct TestDataGenerator {
    store: Arc<dyn JournalStore>,
}

impl TestDataGenerator {
    pub fn new(store: Arc<dyn JournalStore>) -> Self {
        Self { store }
    }

    /// 테스트 거래 생성
    ///
    /// (owner, profile_id, test_run_id)에 이미 행이 있으면 no-op으로
    /// 기존 개수를 반환한다 — 클라이언트 재시도가 중복을 만들지 않는다.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerationReport, CoreError> {
        if request.count == 0 || request.count > GENERATE_CAP {
            return Err(CoreError::Validation(format!(
                "count must be between 1 and {}",
                GENERATE_CAP
            )));
        }
        if request.profile_id.is_empty() {
            return Err(CoreError::Validation("profile_id is required".to_string()));
        }

        let test_run_id = request
            .test_run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // 멱등성 가드: 실행 마커가 있거나 이 run의 행이 이미 있으면
        // 아무것도 하지 않는다. 행 카운트도 함께 보는 이유는 삽입과 마커
        // 기록 사이에서 중단된 이전 실행을 잡아내기 위해서다.
        let run_filter = TradeFilter::for_owner(&request.owner)
            .profile(&request.profile_id)
            .test_run(&test_run_id);
        let marker = self
            .store
            .find_test_run(&request.owner, &request.profile_id, &test_run_id)
            .await?;
        let existing = self.store.count(&run_filter).await?;
        if marker.is_some() || existing > 0 {
            info!(
                test_run_id,
                existing, "generation already applied, returning stored count"
            );
            return Ok(GenerationReport {
                test_run_id,
                requested: request.count,
                generated: 0,
                inserted: 0,
                verified: existing,
                already_existed: true,
            });
        }

        let trades = build_trades(&request, &test_run_id);
        let generated = trades.len() as u64;

        let inserted = self.insert_batches(&trades).await?;

        // 사후 검증: 요청 == 생성 == 삽입 == 재조회
        let verified = self.store.count(&run_filter).await?;
        if verified != request.count || inserted != request.count || generated != request.count {
            return Err(CoreError::Storage(format!(
                "generation verification failed: requested={} generated={} inserted={} verified={}",
                request.count, generated, inserted, verified
            )));
        }

        self.store
            .create_test_run(&TestRun {
                test_run_id: test_run_id.clone(),
                profile_id: request.profile_id.clone(),
                owner: request.owner.clone(),
                count: request.count,
                seed: request.seed,
                mode: request.mode.clone(),
                created_at: Utc::now(),
            })
            .await?;

        info!(test_run_id, inserted, "test data generated");

        Ok(GenerationReport {
            test_run_id,
            requested: request.count,
            generated,
            inserted,
            verified,
            already_existed: false,
        })
    }

    /// 배치 삽입. 배치 내/배치 간 중복 id는 치명적이며 남은 배치를 중단한다.
    async fn insert_batches(&self, trades: &[Trade]) -> Result<u64, CoreError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut inserted: u64 = 0;

        for batch in trades.chunks(BATCH_SIZE) {
            for trade in batch {
                if !seen.insert(trade.id.as_str()) {
                    // 금융 집계를 조용히 오염시키지 않도록 즉시 중단
                    warn!(trade_id = %trade.id, "duplicate id in generation batch, aborting");
                    return Err(CoreError::DuplicateId(trade.id.clone()));
                }
            }

            self.store.bulk_create(batch).await?;
            inserted += batch.len() as u64;

            if inserted < trades.len() as u64 {
                tokio::time::sleep(std::time::Duration::from_millis(BATCH_DELAY_MS)).await;
            }
        }

        Ok(inserted)
    }

    /// 스코프된 일괄 삭제. 삭제된 행 수를 반환한다.
    /// id 수집에 상한을 두고, 배치 사이에 짧게 대기한다.
    pub async fn wipe(&self, request: WipeRequest) -> Result<u64, CoreError> {
        if request.profile_id.is_empty() {
            return Err(CoreError::Validation("profile_id is required".to_string()));
        }

        let mut filter = TradeFilter::for_owner(&request.owner).profile(&request.profile_id);
        if let Some(test_run_id) = &request.test_run_id {
            filter = filter.test_run(test_run_id);
        }

        let ids = self.store.collect_ids(&filter, ID_COLLECT_CAP).await?;
        let total = ids.len();
        let mut deleted: u64 = 0;

        for batch in ids.chunks(BATCH_SIZE) {
            deleted += self.store.delete_by_ids(&request.owner, batch).await?;

            if (deleted as usize) < total {
                tokio::time::sleep(std::time::Duration::from_millis(BATCH_DELAY_MS)).await;
            }
        }

        info!(
            owner = %request.owner,
            profile_id = %request.profile_id,
            deleted,
            "scoped wipe complete"
        );
        Ok(deleted)
    }
}

/// (seed, params)로부터 결정적으로 거래 목록 생성
/// id까지 결정적이므로 같은 요청은 바이트 단위로 같은 집합을 만든다.
fn build_trades(request: &GenerateRequest, test_run_id: &str) -> Vec<Trade> {
    const COINS: [&str; 6] = [
        "BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "LINKUSDT",
    ];

    let mut rng = SeededRng::new(request.seed);
    let now = Utc::now();
    let mut trades = Vec::with_capacity(request.count as usize);

    for i in 0..request.count {
        let coin = *rng.pick(&COINS);
        let direction = if rng.chance(0.5) {
            Direction::Long
        } else {
            Direction::Short
        };
        let entry_price = rng.range(10.0, 50_000.0);
        let size_usd = rng.range(100.0, 5_000.0);
        let balance = 10_000.0;

        // 70%는 스탑 보유, 30%는 리스크 미정의
        let stop_price = rng.chance(0.7).then(|| match direction {
            Direction::Long => entry_price * rng.range(0.90, 0.99),
            Direction::Short => entry_price * rng.range(1.01, 1.10),
        });
        let take_price = rng.chance(0.6).then(|| match direction {
            Direction::Long => entry_price * rng.range(1.02, 1.30),
            Direction::Short => entry_price * rng.range(0.70, 0.98),
        });

        // 모드에 따른 승패 결정
        let win = match request.mode.as_str() {
            "winners" => true,
            "losers" => false,
            _ => rng.chance(0.5),
        };
        let move_pct = rng.range(0.01, 0.15);
        let close_price = match (direction, win) {
            (Direction::Long, true) | (Direction::Short, false) => entry_price * (1.0 + move_pct),
            _ => entry_price * (1.0 - move_pct),
        };

        // 20%는 열린 포지션으로 남긴다
        let open = rng.chance(0.2);
        let date_open = now - Duration::days(rng.range(1.0, 180.0) as i64);

        let risk_usd = metrics::risk(entry_price, stop_price, size_usd);
        let pnl_usd = if open {
            0.0
        } else {
            metrics::pnl(direction, entry_price, close_price, size_usd).unwrap_or(0.0)
        };

        trades.push(Trade {
            id: format!("gen-{}-{:04}", test_run_id, i),
            owner: request.owner.clone(),
            profile_id: request.profile_id.clone(),
            external_id: None,
            coin: coin.to_string(),
            direction,
            entry_price,
            original_entry_price: entry_price,
            position_size: size_usd,
            stop_price,
            take_price,
            close_price: (!open).then_some(close_price),
            date_open,
            date_close: (!open).then(|| date_open + Duration::hours(rng.range(1.0, 72.0) as i64)),
            risk_usd,
            risk_percent: metrics::risk_percent(risk_usd, balance),
            rr_ratio: metrics::rr(entry_price, take_price, stop_price),
            pnl_usd,
            pnl_percent_of_balance: pnl_usd / balance * 100.0,
            r_multiple: if open {
                None
            } else {
                metrics::r_multiple(pnl_usd, risk_usd)
            },
            realized_pnl_usd: pnl_usd,
            adds_history: Vec::new(),
            partial_closes: Vec::new(),
            account_balance_at_entry: Some(balance),
            test_run_id: Some(test_run_id.to_string()),
            import_source: ImportSource::Generator,
        });
    }

    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemoryJournalStore, TradeStore};

    fn request(count: u64, seed: u64, run: &str) -> GenerateRequest {
        GenerateRequest {
            owner: "user1".to_string(),
            profile_id: "profile1".to_string(),
            count,
            seed,
            mode: "mixed".to_string(),
            test_run_id: Some(run.to_string()),
        }
    }

    #[test]
    fn test_rng_is_deterministic() {
        let mut a = SeededRng::new(42);
        let mut b = SeededRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
        // 다른 시드는 다른 스트림
        let mut c = SeededRng::new(43);
        assert_ne!(SeededRng::new(42).next_f64(), c.next_f64());
    }

    #[test]
    fn test_rng_outputs_in_unit_interval() {
        let mut rng = SeededRng::new(7);
        for _ in 0..1000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_build_trades_is_deterministic() {
        let a = build_trades(&request(20, 99, "run"), "run");
        let b = build_trades(&request(20, 99, "run"), "run");
        assert_eq!(a.len(), 20);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.coin, y.coin);
            assert_eq!(x.entry_price, y.entry_price);
            assert_eq!(x.close_price, y.close_price);
        }
    }

    #[test]
    fn test_build_trades_open_iff_no_close_price() {
        for trade in build_trades(&request(50, 7, "run"), "run") {
            assert_eq!(trade.is_open(), trade.date_close.is_none());
            if trade.stop_price.is_none() {
                // 스탑 없음 = 리스크 미정의, 0이 아니다
                assert_eq!(trade.risk_usd, None);
                assert_eq!(trade.risk_percent, None);
            }
        }
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store.clone());

        let first = generator.generate(request(30, 5, "run-a")).await.unwrap();
        assert_eq!(first.inserted, 30);
        assert_eq!(first.verified, 30);
        assert!(!first.already_existed);

        // 같은 test_run_id로 재호출 → 0건 삽입, 기존 개수 반환
        let second = generator.generate(request(30, 5, "run-a")).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.verified, 30);
        assert!(second.already_existed);

        let count = store
            .count(&TradeFilter::for_owner("user1").test_run("run-a"))
            .await
            .unwrap();
        assert_eq!(count, 30);
    }

    #[tokio::test]
    async fn test_generate_skips_run_with_marker_but_no_rows() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store.clone());

        // 행은 없지만 실행 마커만 남아 있는 run — 이미 적용된 것으로 본다
        store
            .create_test_run(&TestRun {
                test_run_id: "run-marked".to_string(),
                profile_id: "profile1".to_string(),
                owner: "user1".to_string(),
                count: 30,
                seed: 5,
                mode: "mixed".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = generator.generate(request(30, 5, "run-marked")).await.unwrap();
        assert!(report.already_existed);
        assert_eq!(report.inserted, 0);

        let count = store
            .count(&TradeFilter::for_owner("user1").test_run("run-marked"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_aborts_remaining_batches() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store.clone());

        // 두 번째 배치에 중복 id를 심는다
        let mut trades = build_trades(&request(120, 1, "run-dup"), "run-dup");
        trades[70].id = trades[10].id.clone();

        let err = generator.insert_batches(&trades).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_ID");

        // 첫 배치만 들어가고 나머지는 중단됨
        let count = store
            .count(&TradeFilter::for_owner("user1").test_run("run-dup"))
            .await
            .unwrap();
        assert_eq!(count, BATCH_SIZE as u64);
    }

    #[tokio::test]
    async fn test_wipe_is_scoped_to_profile() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store.clone());

        generator.generate(request(10, 1, "run-a")).await.unwrap();

        let mut other = request(5, 2, "run-b");
        other.profile_id = "profile2".to_string();
        generator.generate(other).await.unwrap();

        let deleted = generator
            .wipe(WipeRequest {
                owner: "user1".to_string(),
                profile_id: "profile1".to_string(),
                test_run_id: None,
            })
            .await
            .unwrap();
        assert_eq!(deleted, 10);

        // 다른 프로필의 행은 남아 있다
        let remaining = store
            .count(&TradeFilter::for_owner("user1").profile("profile2"))
            .await
            .unwrap();
        assert_eq!(remaining, 5);
    }

    #[tokio::test]
    async fn test_wipe_can_target_single_run() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store.clone());

        generator.generate(request(10, 1, "run-a")).await.unwrap();
        generator.generate(request(5, 2, "run-b")).await.unwrap();

        let deleted = generator
            .wipe(WipeRequest {
                owner: "user1".to_string(),
                profile_id: "profile1".to_string(),
                test_run_id: Some("run-a".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 10);

        let remaining = store
            .count(&TradeFilter::for_owner("user1").profile("profile1"))
            .await
            .unwrap();
        assert_eq!(remaining, 5);
    }

    #[tokio::test]
    async fn test_generate_rejects_invalid_count() {
        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store);

        let err = generator.generate(request(0, 1, "run")).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let store = Arc::new(MemoryJournalStore::new());
        let generator = TestDataGenerator::new(store);
        let err = generator
            .generate(request(GENERATE_CAP + 1, 1, "run"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
