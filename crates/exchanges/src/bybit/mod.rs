pub mod api;

pub use api::{BybitClosedPnl, BybitExecution, BybitPosition, ClosedPnlPage, ExecutionPage};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::env;
use std::time::Duration;

use interface::{ExchangeApiErrorKind, ExchangeError};

/// 릴레이를 거치지 않을 때의 기본 엔드포인트
const DEFAULT_BASE_URL: &str = "https://api.bybit.com";

/// 모든 아웃바운드 요청에 적용되는 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bybit 서명용 recvWindow (ms)
const RECV_WINDOW: &str = "50000";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 서명 생성 (hex 인코딩)
pub fn generate_signature(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// 현재 UTC 시간 (ms)
pub fn get_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Bybit v5 API 클라이언트
/// 요청은 내부 릴레이(BYBIT_RELAY_URL)를 통해 프록시되며,
/// 릴레이 인증은 공유 시크릿 헤더(x-relay-secret)로 처리한다.
#[derive(Clone)]
pub struct BybitClient {
    pub http: reqwest::Client,
    pub api_key: String,
    api_secret: String,
    base_url: String,
    relay_secret: Option<String>,
}

impl BybitClient {
    /// API 키/시크릿으로 클라이언트 생성
    /// 릴레이 주소와 릴레이 시크릿은 환경 변수에서 읽는다.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let base_url =
            env::var("BYBIT_RELAY_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let relay_secret = env::var("RELAY_SHARED_SECRET").ok();

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url,
            relay_secret,
        }
    }

    /// 서명된 GET 요청을 보내고 Bybit 응답 봉투를 해석하여 result를 반환
    ///
    /// 서명 페이로드는 Bybit v5 규칙대로
    /// `timestamp + apiKey + recvWindow + queryString`이다.
    pub(crate) async fn signed_get(
        &self,
        path: &str,
        query_string: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let timestamp = get_timestamp().to_string();
        let payload = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, query_string);
        let signature = generate_signature(&payload, &self.api_secret);

        let url = format!("{}{}?{}", self.base_url, path, query_string);

        let mut request = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", self.api_key.as_str())
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature);

        if let Some(secret) = &self.relay_secret {
            request = request.header("x-relay-secret", secret.as_str());
        }

        let response = request.send().await.map_err(ExchangeError::from)?;

        let status = response.status();
        let response_text = response.text().await.map_err(ExchangeError::from)?;

        if !status.is_success() {
            return Err(ExchangeError::Other(format!(
                "Bybit API HTTP error: status {}, response: {}",
                status,
                response_text.chars().take(200).collect::<String>()
            )));
        }

        let envelope: api::BybitEnvelope =
            serde_json::from_str(&response_text).map_err(|e| {
                ExchangeError::Other(format!(
                    "Failed to parse Bybit response: {}, response: {}",
                    e,
                    response_text.chars().take(200).collect::<String>()
                ))
            })?;

        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                kind: ExchangeApiErrorKind::from_ret_code(envelope.ret_code),
                ret_code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        Ok(envelope.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let a = generate_signature("timestamp=1&recvWindow=50000", "secret");
        let b = generate_signature("timestamp=1&recvWindow=50000", "secret");
        assert_eq!(a, b);
        // SHA-256 → 32바이트 → hex 64자
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_secret_and_payload() {
        let base = generate_signature("payload", "secret");
        assert_ne!(base, generate_signature("payload", "other-secret"));
        assert_ne!(base, generate_signature("payload2", "secret"));
    }
}
