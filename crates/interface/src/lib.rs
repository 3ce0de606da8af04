use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// 포지션 방향 (롱/숏)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// 롱 포지션
    Long,
    /// 숏 포지션
    Short,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            _ => Err(format!("Invalid Direction: {}", s)),
        }
    }
}

/// 거래 기록의 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportSource {
    /// 수동 입력
    Manual,
    /// 테스트 데이터 생성기
    Generator,
    /// Bybit 동기화
    BybitSync,
}

impl Display for ImportSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportSource::Manual => write!(f, "MANUAL"),
            ImportSource::Generator => write!(f, "GENERATOR"),
            ImportSource::BybitSync => write!(f, "BYBIT_SYNC"),
        }
    }
}

impl FromStr for ImportSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(ImportSource::Manual),
            "GENERATOR" => Ok(ImportSource::Generator),
            "BYBIT_SYNC" => Ok(ImportSource::BybitSync),
            _ => Err(format!("Invalid ImportSource: {}", s)),
        }
    }
}

/// 추가 진입 기록 (물타기/불타기 1건)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// 체결 가격
    pub price: f64,
    /// 체결 명목 금액 (USD)
    pub size_usd: f64,
    /// 체결 UTC 시간
    pub timestamp: DateTime<Utc>,
}

/// 부분 청산 기록 1건
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialClose {
    /// 청산 시점 잔여 수량 대비 비율 (0.0 ~ 100.0)
    pub percent: f64,
    /// 청산 가격
    pub price: f64,
    /// 해당 청산분의 실현 손익 (USD)
    pub pnl_usd: f64,
    /// 청산 UTC 시간
    pub timestamp: DateTime<Utc>,
}

/// 거래소 API 에러 분류
/// Bybit 고유 retCode를 작은 고정 분류 체계로 매핑한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeApiErrorKind {
    /// API 키가 잘못됨
    InvalidApiKey,
    /// 서명이 잘못됨
    InvalidSignature,
    /// 권한 부족
    InsufficientPermissions,
    /// 허용되지 않은 IP
    IpNotAllowed,
    /// 기타
    Other,
}

impl ExchangeApiErrorKind {
    /// Bybit retCode → 분류
    pub fn from_ret_code(ret_code: i64) -> Self {
        match ret_code {
            10003 => ExchangeApiErrorKind::InvalidApiKey,
            10004 => ExchangeApiErrorKind::InvalidSignature,
            10005 => ExchangeApiErrorKind::InsufficientPermissions,
            10010 => ExchangeApiErrorKind::IpNotAllowed,
            _ => ExchangeApiErrorKind::Other,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            ExchangeApiErrorKind::InvalidApiKey => "EXCHANGE_INVALID_API_KEY",
            ExchangeApiErrorKind::InvalidSignature => "EXCHANGE_INVALID_SIGNATURE",
            ExchangeApiErrorKind::InsufficientPermissions => "EXCHANGE_INSUFFICIENT_PERMISSIONS",
            ExchangeApiErrorKind::IpNotAllowed => "EXCHANGE_IP_NOT_ALLOWED",
            ExchangeApiErrorKind::Other => "EXCHANGE_ERROR",
        }
    }
}

/// 거래소/릴레이 통신 에러
/// 타임아웃과 연결 실패는 사용자에게 구분되어 보여야 하므로 별도 variant로 둔다.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange api error (retCode={ret_code}): {message}")]
    Api {
        kind: ExchangeApiErrorKind,
        ret_code: i64,
        message: String,
    },

    #[error("other error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// 클라이언트가 분기할 수 있는 안정적인 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            ExchangeError::Timeout(_) => "RELAY_TIMEOUT",
            ExchangeError::RelayUnreachable(_) => "RELAY_UNREACHABLE",
            ExchangeError::Network(_) => "NETWORK_ERROR",
            ExchangeError::Api { kind, .. } => kind.as_code(),
            ExchangeError::Other(_) => "EXCHANGE_ERROR",
        }
    }
}

/// reqwest 에러를 타임아웃/연결 실패/기타 네트워크 에러로 분류
impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout(e.to_string())
        } else if e.is_connect() {
            ExchangeError::RelayUnreachable(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

/// 코어 엔진 에러 체계
/// 모든 variant는 안정적인 error_code 문자열과 HTTP 상태 코드를 가진다.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("authentication required")]
    AuthRequired,

    #[error("no active profile for owner")]
    NoActiveProfile,

    #[error("profile limit reached (max {0})")]
    ProfileLimitReached(usize),

    #[error("profile integrity violation: owner={owner}, active_count={active_count}")]
    IntegrityViolation { owner: String, active_count: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// 클라이언트가 사람용 메시지를 파싱하지 않고 분기할 수 있는 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::AuthRequired => "AUTH_REQUIRED",
            CoreError::NoActiveProfile => "NO_ACTIVE_PROFILE",
            CoreError::ProfileLimitReached(_) => "PROFILE_LIMIT_REACHED",
            CoreError::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::DuplicateId(_) => "DUPLICATE_ID",
            CoreError::Exchange(e) => e.error_code(),
            CoreError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// HTTP 응답 상태 코드 매핑
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::AuthRequired => 401,
            CoreError::NoActiveProfile => 404,
            CoreError::ProfileLimitReached(_) => 400,
            CoreError::IntegrityViolation { .. } => 500,
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::DuplicateId(_) => 500,
            CoreError::Exchange(_) => 502,
            CoreError::Storage(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_roundtrip() {
        assert_eq!(Direction::Long.to_string(), "LONG");
        assert_eq!(Direction::from_str("SHORT").unwrap(), Direction::Short);
        assert!(Direction::from_str("long").is_err());
    }

    #[test]
    fn test_ret_code_mapping() {
        assert_eq!(
            ExchangeApiErrorKind::from_ret_code(10003),
            ExchangeApiErrorKind::InvalidApiKey
        );
        assert_eq!(
            ExchangeApiErrorKind::from_ret_code(10004),
            ExchangeApiErrorKind::InvalidSignature
        );
        assert_eq!(
            ExchangeApiErrorKind::from_ret_code(99999),
            ExchangeApiErrorKind::Other
        );
    }

    #[test]
    fn test_error_code_stability() {
        assert_eq!(CoreError::AuthRequired.error_code(), "AUTH_REQUIRED");
        assert_eq!(CoreError::AuthRequired.status_code(), 401);
        assert_eq!(CoreError::NoActiveProfile.status_code(), 404);
        assert_eq!(
            CoreError::Exchange(ExchangeError::Timeout("t".to_string())).error_code(),
            "RELAY_TIMEOUT"
        );
    }
}
