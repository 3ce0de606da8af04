use interface::Direction;

/// 손익/리스크/R-배수 계산 모듈
/// 모든 함수는 전역적(total)이고 부수효과가 없다.
/// NaN/Infinity는 절대 반환하지 않는다 — 그런 경우는 None으로 매핑된다.

/// 유한하지 않은 값을 None으로 걸러낸다
fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// 손익 (USD)
/// Long → size·(close/entry − 1), Short → size·(1 − close/entry)
/// entry ≤ 0이면 정의되지 않음 (None)
pub fn pnl(direction: Direction, entry: f64, close: f64, size_usd: f64) -> Option<f64> {
    if entry <= 0.0 || !entry.is_finite() || !close.is_finite() || !size_usd.is_finite() {
        return None;
    }
    let value = match direction {
        Direction::Long => size_usd * (close / entry - 1.0),
        Direction::Short => size_usd * (1.0 - close / entry),
    };
    finite(value)
}

/// 리스크 금액 (USD)
/// 스탑이 없으면 None — "리스크 미정의"는 리스크 0과 다르다.
pub fn risk(entry: f64, stop: Option<f64>, size_usd: f64) -> Option<f64> {
    let stop = stop?;
    if entry <= 0.0 || !entry.is_finite() || !stop.is_finite() || !size_usd.is_finite() {
        return None;
    }
    finite((entry - stop).abs() / entry * size_usd)
}

/// 리스크의 잔고 대비 비율 (%)
pub fn risk_percent(risk_usd: Option<f64>, balance: f64) -> Option<f64> {
    let risk_usd = risk_usd?;
    if balance <= 0.0 || !balance.is_finite() {
        return None;
    }
    finite(risk_usd / balance * 100.0)
}

/// R-배수: 실현 손익을 최초 리스크 금액의 배수로 표현
/// 리스크가 None이거나 0이면 None
pub fn r_multiple(pnl_usd: f64, original_risk_usd: Option<f64>) -> Option<f64> {
    let risk = original_risk_usd?;
    if risk == 0.0 || !risk.is_finite() || !pnl_usd.is_finite() {
        return None;
    }
    finite(pnl_usd / risk)
}

/// 손익비 (reward/risk)
/// take와 stop이 둘 다 있고 단위 리스크 > 0일 때만 정의된다.
pub fn rr(entry: f64, take: Option<f64>, stop: Option<f64>) -> Option<f64> {
    let take = take?;
    let stop = stop?;
    if entry <= 0.0 || !entry.is_finite() || !take.is_finite() || !stop.is_finite() {
        return None;
    }
    let risk = (entry - stop).abs();
    if risk <= 0.0 {
        return None;
    }
    let reward = (take - entry).abs();
    finite(reward / risk)
}
