use serde::Deserialize;

use interface::ExchangeError;

use super::BybitClient;

/// Bybit v5 공통 응답 봉투
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BybitEnvelope {
    pub ret_code: i64,
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Bybit이 문자열로 보내는 숫자 필드 파싱
/// 빈 문자열("")은 값 없음으로 취급한다.
fn parse_opt_f64(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_f64(s: &str) -> f64 {
    parse_opt_f64(s).unwrap_or(0.0)
}

fn parse_ms(s: &str) -> i64 {
    s.parse::<i64>().unwrap_or(0)
}

/// 현재 보유 중인 포지션 1건
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy"(롱) 또는 "Sell"(숏)
    pub side: String,
    pub size: String,
    pub avg_price: String,
    #[serde(default)]
    pub position_idx: i64,
    #[serde(default)]
    pub stop_loss: String,
    #[serde(default)]
    pub take_profit: String,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub updated_time: String,
}

impl BybitPosition {
    pub fn qty(&self) -> f64 {
        parse_f64(&self.size)
    }

    pub fn avg_price_f64(&self) -> f64 {
        parse_f64(&self.avg_price)
    }

    /// USD 명목 금액 (수량 × 평단가)
    pub fn notional_usd(&self) -> f64 {
        self.qty() * self.avg_price_f64()
    }

    pub fn stop_loss_f64(&self) -> Option<f64> {
        parse_opt_f64(&self.stop_loss)
    }

    pub fn take_profit_f64(&self) -> Option<f64> {
        parse_opt_f64(&self.take_profit)
    }

    pub fn created_ms(&self) -> i64 {
        parse_ms(&self.created_time)
    }
}

/// 체결 내역 1건
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitExecution {
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub exec_time: String,
    #[serde(default)]
    pub exec_price: String,
    #[serde(default)]
    pub exec_qty: String,
}

impl BybitExecution {
    pub fn exec_ms(&self) -> i64 {
        parse_ms(&self.exec_time)
    }
}

/// 청산 완료된 포지션의 손익 레코드 1건
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitClosedPnl {
    pub symbol: String,
    /// 청산 주문의 방향. "Sell"이면 롱 포지션 청산, "Buy"면 숏 포지션 청산.
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub avg_entry_price: String,
    #[serde(default)]
    pub avg_exit_price: String,
    #[serde(default)]
    pub closed_pnl: String,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub updated_time: String,
}

impl BybitClosedPnl {
    pub fn entry_price(&self) -> f64 {
        parse_f64(&self.avg_entry_price)
    }

    pub fn exit_price(&self) -> f64 {
        parse_f64(&self.avg_exit_price)
    }

    pub fn pnl_usd(&self) -> f64 {
        parse_f64(&self.closed_pnl)
    }

    /// USD 명목 금액
    pub fn notional_usd(&self) -> f64 {
        parse_f64(&self.qty) * self.entry_price()
    }

    pub fn created_ms(&self) -> i64 {
        parse_ms(&self.created_time)
    }

    /// 업서트 키로 쓰는 타임스탬프. updatedTime이 없으면 createdTime으로 폴백.
    pub fn updated_ms(&self) -> i64 {
        let updated = parse_ms(&self.updated_time);
        if updated > 0 {
            updated
        } else {
            self.created_ms()
        }
    }
}

/// 커서 페이지네이션 응답 (체결 내역)
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub list: Vec<BybitExecution>,
    pub next_page_cursor: String,
}

/// 커서 페이지네이션 응답 (청산 손익)
#[derive(Debug, Clone)]
pub struct ClosedPnlPage {
    pub list: Vec<BybitClosedPnl>,
    pub next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
    #[serde(default)]
    next_page_cursor: String,
}

impl BybitClient {
    /// 서버 시간 조회 (ms)
    pub async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TimeResult {
            time_second: String,
        }

        let result = self.signed_get("/v5/market/time", "").await?;
        let parsed: TimeResult = serde_json::from_value(result)
            .map_err(|e| ExchangeError::Other(format!("Failed to parse server time: {}", e)))?;

        let seconds = parsed
            .time_second
            .parse::<i64>()
            .map_err(|e| ExchangeError::Other(format!("Invalid timeSecond: {}", e)))?;

        Ok(seconds * 1000)
    }

    /// 지갑 잔고 조회 (UNIFIED 계정의 totalEquity, USD)
    pub async fn get_wallet_balance(&self) -> Result<f64, ExchangeError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Account {
            #[serde(default)]
            total_equity: String,
        }

        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let parsed: ListResult<Account> = serde_json::from_value(result)
            .map_err(|e| ExchangeError::Other(format!("Failed to parse wallet balance: {}", e)))?;

        let account = parsed
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Other("Empty wallet balance list".to_string()))?;

        Ok(parse_f64(&account.total_equity))
    }

    /// 현재 열려 있는 포지션 전체 조회
    /// size가 0인 슬롯은 제외한다.
    pub async fn get_positions(&self) -> Result<Vec<BybitPosition>, ExchangeError> {
        let result = self
            .signed_get("/v5/position/list", "category=linear&settleCoin=USDT&limit=200")
            .await?;
        let parsed: ListResult<BybitPosition> = serde_json::from_value(result)
            .map_err(|e| ExchangeError::Other(format!("Failed to parse positions: {}", e)))?;

        Ok(parsed
            .list
            .into_iter()
            .filter(|p| p.qty() > 0.0)
            .collect())
    }

    /// 체결 내역 조회 (start_time_ms 이후)
    pub async fn get_executions(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ExecutionPage, ExchangeError> {
        let mut query = format!("category=linear&startTime={}&limit=100", start_time_ms);
        if let Some(cursor) = cursor {
            if !cursor.is_empty() {
                query.push_str(&format!("&cursor={}", cursor));
            }
        }

        let result = self.signed_get("/v5/execution/list", &query).await?;
        let parsed: ListResult<BybitExecution> = serde_json::from_value(result)
            .map_err(|e| ExchangeError::Other(format!("Failed to parse executions: {}", e)))?;

        Ok(ExecutionPage {
            list: parsed.list,
            next_page_cursor: parsed.next_page_cursor,
        })
    }

    /// 청산 손익 조회 (start_time_ms 이후, 커서 페이지네이션)
    pub async fn get_closed_pnl(
        &self,
        start_time_ms: i64,
        cursor: Option<&str>,
    ) -> Result<ClosedPnlPage, ExchangeError> {
        let mut query = format!("category=linear&startTime={}&limit=100", start_time_ms);
        if let Some(cursor) = cursor {
            if !cursor.is_empty() {
                query.push_str(&format!("&cursor={}", cursor));
            }
        }

        let result = self.signed_get("/v5/position/closed-pnl", &query).await?;
        let parsed: ListResult<BybitClosedPnl> = serde_json::from_value(result)
            .map_err(|e| ExchangeError::Other(format!("Failed to parse closed pnl: {}", e)))?;

        Ok(ClosedPnlPage {
            list: parsed.list,
            next_page_cursor: parsed.next_page_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opt_f64_empty_is_none() {
        assert_eq!(parse_opt_f64(""), None);
        assert_eq!(parse_opt_f64("1.5"), Some(1.5));
        assert_eq!(parse_opt_f64("abc"), None);
    }

    #[test]
    fn test_closed_pnl_updated_ms_fallback() {
        let record = BybitClosedPnl {
            symbol: "BTCUSDT".to_string(),
            side: "Sell".to_string(),
            qty: "0.5".to_string(),
            avg_entry_price: "50000".to_string(),
            avg_exit_price: "51000".to_string(),
            closed_pnl: "500".to_string(),
            created_time: "1700000000000".to_string(),
            updated_time: "".to_string(),
        };
        assert_eq!(record.updated_ms(), 1700000000000);
        assert_eq!(record.notional_usd(), 25000.0);
    }

    #[test]
    fn test_position_parsing() {
        let json = serde_json::json!({
            "symbol": "ETHUSDT",
            "side": "Buy",
            "size": "2",
            "avgPrice": "3000",
            "positionIdx": 1,
            "stopLoss": "",
            "takeProfit": "3500",
            "createdTime": "1700000000000",
            "updatedTime": "1700000001000"
        });
        let position: BybitPosition = serde_json::from_value(json).unwrap();
        assert_eq!(position.qty(), 2.0);
        assert_eq!(position.notional_usd(), 6000.0);
        assert_eq!(position.stop_loss_f64(), None);
        assert_eq!(position.take_profit_f64(), Some(3500.0));
    }
}
