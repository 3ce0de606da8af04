use chrono::{DateTime, Utc};

use interface::{Direction, Fill, PartialClose};

use crate::metrics;

/// 진입/추가 진입/부분 청산 이력으로부터 평균 진입가, 잔여 수량,
/// 실현 손익을 도출하는 포지션 원장.
///
/// 평균 진입가는 수량 가중이다: qty_i = size_usd_i / price_i,
/// avgEntry = Σsize_usd_i / Σqty_i. 부분 청산은 원래 수량이 아니라
/// *잔여* 수량의 비율만큼 줄이며, 반드시 시간순으로 적용된다.
pub struct PositionLedger {
    direction: Direction,
    /// 잔여 수량 (코인 단위)
    remaining_qty: f64,
    /// 잔여 명목 금액 (USD, 평균 진입가 기준)
    remaining_size_usd: f64,
    /// 부분 청산으로 이미 실현된 손익 합계
    partial_pnl_sum: f64,
}

/// 시간순 재생을 위한 이벤트
enum Event<'a> {
    Add(&'a Fill),
    PartialClose(&'a PartialClose),
}

impl Event<'_> {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Add(f) => f.timestamp,
            Event::PartialClose(p) => p.timestamp,
        }
    }
}

impl PositionLedger {
    /// 최초 진입과 이후 이력으로 원장 구성
    /// adds와 partials는 타임스탬프 기준으로 병합되어 시간순으로 재생된다.
    pub fn replay(
        direction: Direction,
        entry_price: f64,
        entry_size_usd: f64,
        adds: &[Fill],
        partials: &[PartialClose],
    ) -> Self {
        let mut ledger = Self {
            direction,
            remaining_qty: 0.0,
            remaining_size_usd: 0.0,
            partial_pnl_sum: 0.0,
        };

        if entry_price > 0.0 && entry_size_usd > 0.0 {
            ledger.remaining_qty = entry_size_usd / entry_price;
            ledger.remaining_size_usd = entry_size_usd;
        }

        let mut events: Vec<Event> = adds
            .iter()
            .map(Event::Add)
            .chain(partials.iter().map(Event::PartialClose))
            .collect();
        events.sort_by_key(|e| e.timestamp());

        for event in events {
            match event {
                Event::Add(fill) => ledger.apply_add(fill),
                Event::PartialClose(partial) => ledger.apply_partial(partial),
            }
        }

        ledger
    }

    /// 추가 진입: 수량과 명목 금액 모두 증가 → 다음 avgEntry 재계산에 반영
    fn apply_add(&mut self, fill: &Fill) {
        if fill.price <= 0.0 || fill.size_usd <= 0.0 {
            return;
        }
        self.remaining_qty += fill.size_usd / fill.price;
        self.remaining_size_usd += fill.size_usd;
    }

    /// 부분 청산: 잔여 수량의 percent만큼 제거
    /// 평균 진입가 기준으로 수량과 명목이 같은 비율로 줄어 avgEntry는 불변이다.
    fn apply_partial(&mut self, partial: &PartialClose) {
        let factor = 1.0 - (partial.percent.clamp(0.0, 100.0) / 100.0);
        self.remaining_qty *= factor;
        self.remaining_size_usd *= factor;
        self.partial_pnl_sum += partial.pnl_usd;
    }

    /// 수량 가중 평균 진입가. 잔여 수량이 없으면 None.
    pub fn avg_entry(&self) -> Option<f64> {
        if self.remaining_qty > 0.0 {
            Some(self.remaining_size_usd / self.remaining_qty)
        } else {
            None
        }
    }

    pub fn remaining_qty(&self) -> f64 {
        self.remaining_qty
    }

    pub fn remaining_size_usd(&self) -> f64 {
        self.remaining_size_usd
    }

    /// 부분 청산으로 이미 실현된 손익 합계
    pub fn partial_pnl_sum(&self) -> f64 {
        self.partial_pnl_sum
    }

    /// 지금 잔여 수량의 percent를 price에 청산하면 실현될 손익
    pub fn slice_pnl(&self, percent: f64, price: f64) -> Option<f64> {
        let avg_entry = self.avg_entry()?;
        let slice_size = self.remaining_size_usd * (percent.clamp(0.0, 100.0) / 100.0);
        metrics::pnl(self.direction, avg_entry, price, slice_size)
    }

    /// 최종 청산 시점의 총 실현 손익
    /// = Σ(부분 청산 pnl) + 모든 부분 청산 이후 잔여 수량에 대한 최종 청산 pnl
    pub fn realized_pnl(&self, close_price: f64) -> Option<f64> {
        let avg_entry = self.avg_entry()?;
        let final_pnl =
            metrics::pnl(self.direction, avg_entry, close_price, self.remaining_size_usd)?;
        Some(self.partial_pnl_sum + final_pnl)
    }
}
