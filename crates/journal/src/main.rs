use color_eyre::eyre;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::info;

use journal::profile::{ProfileIntegrityManager, DEFAULT_STARTING_BALANCE};
use journal::record::SqliteJournalStore;
use journal::server::{start_server, AppState};
use journal::testdata::{GenerateRequest, TestDataGenerator, WipeRequest};

// lib.rs에서 자동으로 dotenv가 로드됨

#[derive(Debug, StructOpt)]
#[structopt(name = "journal", about = "트레이딩 저널 포지션/동기화 엔진")]
enum Command {
    /// API 서버 실행
    Serve,
    /// 소유자의 프로필 불변식 점검 및 복구
    Heal {
        /// 소유자 id
        owner: String,
    },
    /// 테스트 거래 데이터 생성 (활성 프로필 대상)
    Generate {
        owner: String,
        #[structopt(long, default_value = "50")]
        count: u64,
        #[structopt(long, default_value = "0")]
        seed: u64,
        /// mixed | winners | losers
        #[structopt(long, default_value = "mixed")]
        mode: String,
        /// 멱등 재시도용 실행 id (생략 시 새로 발급)
        #[structopt(long)]
        test_run_id: Option<String>,
    },
    /// 테스트 거래 데이터 삭제 (활성 프로필 범위)
    Wipe {
        owner: String,
        #[structopt(long)]
        test_run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // init error reporting
    color_eyre::install()?;

    // init logging
    let _guards = journal::logger::init_tracing();

    let store = Arc::new(
        SqliteJournalStore::new()
            .await
            .map_err(|e| eyre::eyre!("거래 기록 저장소 초기화 실패: {}", e))?,
    );

    let cmd = Command::from_args();
    match cmd {
        Command::Serve => run_server(store).await,
        Command::Heal { owner } => run_heal(store, &owner).await,
        Command::Generate {
            owner,
            count,
            seed,
            mode,
            test_run_id,
        } => run_generate(store, &owner, count, seed, mode, test_run_id).await,
        Command::Wipe { owner, test_run_id } => run_wipe(store, &owner, test_run_id).await,
    }
}

async fn run_server(store: Arc<SqliteJournalStore>) -> eyre::Result<()> {
    let port = std::env::var("JOURNAL_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(12095);

    let state = AppState::new(store);
    start_server(port, state)
        .await
        .map_err(|e| eyre::eyre!("API 서버 실행 중 오류 발생: {}", e))
}

async fn run_heal(store: Arc<SqliteJournalStore>, owner: &str) -> eyre::Result<()> {
    let manager = ProfileIntegrityManager::new(store);
    let state = manager.observe_state(owner).await?;
    info!("현재 프로필 상태: {:?}", state);

    let healed = manager.ensure_healed(owner).await?;
    info!(
        "활성 프로필: {} ({})",
        healed.profile_name, healed.id
    );
    Ok(())
}

async fn run_generate(
    store: Arc<SqliteJournalStore>,
    owner: &str,
    count: u64,
    seed: u64,
    mode: String,
    test_run_id: Option<String>,
) -> eyre::Result<()> {
    let profiles = ProfileIntegrityManager::new(store.clone());
    let profile = profiles
        .ensure_default_profile(owner, DEFAULT_STARTING_BALANCE)
        .await?;

    let generator = TestDataGenerator::new(store);
    let report = generator
        .generate(GenerateRequest {
            owner: owner.to_string(),
            profile_id: profile.id,
            count,
            seed,
            mode,
            test_run_id,
        })
        .await?;

    info!(
        "생성 완료: run={} inserted={} verified={}",
        report.test_run_id, report.inserted, report.verified
    );
    Ok(())
}

async fn run_wipe(
    store: Arc<SqliteJournalStore>,
    owner: &str,
    test_run_id: Option<String>,
) -> eyre::Result<()> {
    let profiles = ProfileIntegrityManager::new(store.clone());
    let profile = profiles.active_profile(owner).await?;

    let generator = TestDataGenerator::new(store);
    let deleted = generator
        .wipe(WipeRequest {
            owner: owner.to_string(),
            profile_id: profile.id,
            test_run_id,
        })
        .await?;

    info!("삭제 완료: {}건", deleted);
    Ok(())
}
