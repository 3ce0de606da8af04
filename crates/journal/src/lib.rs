use ctor::ctor;

pub mod ledger;
pub mod logger;
pub mod metrics;
pub mod profile;
pub mod record;
pub mod server;
pub mod sync;
pub mod testdata;
pub mod trades;

/// 프로세스 시작 시 .env를 자동으로 로드한다
/// (테스트 바이너리 포함 — 환경 의존 코드가 어디서 실행되든 동일하게 동작)
#[ctor]
fn init_env() {
    let _ = dotenv::dotenv();
}
