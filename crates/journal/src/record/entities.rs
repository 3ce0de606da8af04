/// 거래/포지션 엔티티 모듈
pub mod trades {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "trades")]
    pub struct Model {
        /// UUID 문자열
        #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
        pub id: String,

        /// 소유자 식별자
        #[sea_orm(column_type = "Text")]
        pub owner: String,

        /// 소속 프로필 id
        #[sea_orm(column_type = "Text")]
        pub profile_id: String,

        /// 거래소 미러링용 결정적 키 (NULL 가능)
        #[sea_orm(column_type = "Text", nullable)]
        pub external_id: Option<String>,

        /// 코인 심볼 (예: "BTCUSDT")
        #[sea_orm(column_type = "Text")]
        pub coin: String,

        /// 방향 (LONG, SHORT)
        #[sea_orm(column_type = "Text")]
        pub direction: String,

        /// 현재 평균 진입가
        #[sea_orm(column_type = "Double")]
        pub entry_price: f64,

        /// 최초 진입가
        #[sea_orm(column_type = "Double")]
        pub original_entry_price: f64,

        /// USD 명목 금액
        #[sea_orm(column_type = "Double")]
        pub position_size: f64,

        #[sea_orm(column_type = "Double", nullable)]
        pub stop_price: Option<f64>,

        #[sea_orm(column_type = "Double", nullable)]
        pub take_price: Option<f64>,

        /// NULL이면 열린 포지션
        #[sea_orm(column_type = "Double", nullable)]
        pub close_price: Option<f64>,

        /// 진입 UTC 시간 (ISO 8601 형식)
        #[sea_orm(column_type = "Text")]
        pub date_open: String,

        #[sea_orm(column_type = "Text", nullable)]
        pub date_close: Option<String>,

        /// 스탑이 없으면 NULL (리스크 미정의)
        #[sea_orm(column_type = "Double", nullable)]
        pub risk_usd: Option<f64>,

        #[sea_orm(column_type = "Double", nullable)]
        pub risk_percent: Option<f64>,

        #[sea_orm(column_type = "Double", nullable)]
        pub rr_ratio: Option<f64>,

        #[sea_orm(column_type = "Double")]
        pub pnl_usd: f64,

        #[sea_orm(column_type = "Double")]
        pub pnl_percent_of_balance: f64,

        #[sea_orm(column_type = "Double", nullable)]
        pub r_multiple: Option<f64>,

        #[sea_orm(column_type = "Double")]
        pub realized_pnl_usd: f64,

        /// 추가 진입 이력 (JSON 배열)
        #[sea_orm(column_type = "Text")]
        pub adds_history: String,

        /// 부분 청산 이력 (JSON 배열)
        #[sea_orm(column_type = "Text")]
        pub partial_closes: String,

        #[sea_orm(column_type = "Double", nullable)]
        pub account_balance_at_entry: Option<f64>,

        /// 테스트 데이터 생성 run id (NULL 가능)
        #[sea_orm(column_type = "Text", nullable)]
        pub test_run_id: Option<String>,

        /// 출처 (MANUAL, GENERATOR, BYBIT_SYNC)
        #[sea_orm(column_type = "Text")]
        pub import_source: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 사용자 프로필 엔티티 모듈
pub mod user_profiles {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "user_profiles")]
    pub struct Model {
        /// UUID 문자열
        #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
        pub id: String,

        #[sea_orm(column_type = "Text")]
        pub owner: String,

        /// 치유된 상태에서는 소유자당 정확히 1개만 true
        #[sea_orm(column_type = "Boolean")]
        pub is_active: bool,

        #[sea_orm(column_type = "Text")]
        pub profile_name: String,

        #[sea_orm(column_type = "Double")]
        pub starting_balance: f64,

        /// 마지막 수정 UTC 시간 (ISO 8601 형식)
        #[sea_orm(column_type = "Text")]
        pub updated_date: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 거래소 연동 설정 엔티티 모듈
pub mod api_settings {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "api_settings")]
    pub struct Model {
        /// 소유자당 1행
        #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
        pub owner: String,

        #[sea_orm(column_type = "Text")]
        pub api_key: String,

        #[sea_orm(column_type = "Text")]
        pub api_secret: String,

        #[sea_orm(column_type = "Boolean")]
        pub bybit_sync_initialized: bool,

        /// 청산 손익 기준 커서 (ms, 단조 비감소)
        #[sea_orm(column_type = "BigInteger")]
        pub closed_baseline_ms: i64,

        /// 체결 내역 기준 커서 (ms, 단조 비감소)
        #[sea_orm(column_type = "BigInteger")]
        pub exec_baseline_ms: i64,

        /// 마지막 동기화 UTC 시간 (NULL 가능)
        #[sea_orm(column_type = "Text", nullable)]
        pub last_sync: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 테스트 실행 마커 엔티티 모듈
pub mod test_runs {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "test_runs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = true)]
        pub id: i64,

        #[sea_orm(column_type = "Text")]
        pub test_run_id: String,

        #[sea_orm(column_type = "Text")]
        pub profile_id: String,

        #[sea_orm(column_type = "Text")]
        pub owner: String,

        /// 요청된 생성 개수
        #[sea_orm(column_type = "BigInteger")]
        pub count: i64,

        /// PRNG 시드
        #[sea_orm(column_type = "BigInteger")]
        pub seed: i64,

        /// 생성 모드 (예: "mixed", "winners", "losers")
        #[sea_orm(column_type = "Text")]
        pub mode: String,

        /// 생성 UTC 시간 (ISO 8601 형식)
        #[sea_orm(column_type = "Text")]
        pub created_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
