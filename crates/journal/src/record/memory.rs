use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{
    ApiSettings, ProfileStore, RecordError, SettingsStore, TestRun, TestRunStore, Trade,
    TradeFilter, TradeStore, UserProfile,
};

/// 메모리 기반 저널 저장소
/// 단위 테스트와 dry-run에서 SQLite 대신 사용한다.
#[derive(Default)]
pub struct MemoryJournalStore {
    trades: RwLock<HashMap<String, Trade>>,
    profiles: RwLock<HashMap<String, UserProfile>>,
    settings: RwLock<HashMap<String, ApiSettings>>,
    test_runs: RwLock<Vec<TestRun>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(trade: &Trade, filter: &TradeFilter) -> bool {
    if trade.owner != filter.owner {
        return false;
    }
    if let Some(profile_id) = &filter.profile_id {
        if &trade.profile_id != profile_id {
            return false;
        }
    }
    if let Some(test_run_id) = &filter.test_run_id {
        if trade.test_run_id.as_ref() != Some(test_run_id) {
            return false;
        }
    }
    if filter.open_only && !trade.is_open() {
        return false;
    }
    true
}

#[async_trait]
impl TradeStore for MemoryJournalStore {
    async fn create(&self, trade: &Trade) -> Result<(), RecordError> {
        let mut trades = self.trades.write().unwrap();
        if trades.contains_key(&trade.id) {
            return Err(RecordError::Other(format!(
                "duplicate trade id: {}",
                trade.id
            )));
        }
        trades.insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn bulk_create(&self, items: &[Trade]) -> Result<(), RecordError> {
        let mut trades = self.trades.write().unwrap();
        for trade in items {
            if trades.contains_key(&trade.id) {
                return Err(RecordError::Other(format!(
                    "duplicate trade id: {}",
                    trade.id
                )));
            }
        }
        for trade in items {
            trades.insert(trade.id.clone(), trade.clone());
        }
        Ok(())
    }

    async fn update(&self, trade: &Trade) -> Result<(), RecordError> {
        let mut trades = self.trades.write().unwrap();
        if !trades.contains_key(&trade.id) {
            return Err(RecordError::Other(format!("no such trade: {}", trade.id)));
        }
        trades.insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn delete_by_ids(&self, owner: &str, ids: &[String]) -> Result<u64, RecordError> {
        let mut trades = self.trades.write().unwrap();
        let mut deleted = 0;
        for id in ids {
            // 소유자 범위 체크: 다른 소유자의 행은 건드리지 않는다
            if trades.get(id).map(|t| t.owner == owner).unwrap_or(false) {
                trades.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn find_by_id(&self, owner: &str, id: &str) -> Result<Option<Trade>, RecordError> {
        let trades = self.trades.read().unwrap();
        Ok(trades.get(id).filter(|t| t.owner == owner).cloned())
    }

    async fn find_by_external_id(
        &self,
        owner: &str,
        external_id: &str,
    ) -> Result<Option<Trade>, RecordError> {
        let trades = self.trades.read().unwrap();
        Ok(trades
            .values()
            .find(|t| t.owner == owner && t.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn filter(
        &self,
        filter: &TradeFilter,
        limit: Option<u64>,
        skip: Option<u64>,
    ) -> Result<Vec<Trade>, RecordError> {
        let trades = self.trades.read().unwrap();
        let mut result: Vec<Trade> = trades
            .values()
            .filter(|t| matches(t, filter))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.date_open.cmp(&a.date_open));

        let skip = skip.unwrap_or(0) as usize;
        let mut result: Vec<Trade> = result.into_iter().skip(skip).collect();
        if let Some(limit) = limit {
            result.truncate(limit as usize);
        }
        Ok(result)
    }

    async fn count(&self, filter: &TradeFilter) -> Result<u64, RecordError> {
        let trades = self.trades.read().unwrap();
        Ok(trades.values().filter(|t| matches(t, filter)).count() as u64)
    }

    async fn collect_ids(&self, filter: &TradeFilter, cap: u64) -> Result<Vec<String>, RecordError> {
        let trades = self.trades.read().unwrap();
        Ok(trades
            .values()
            .filter(|t| matches(t, filter))
            .take(cap as usize)
            .map(|t| t.id.clone())
            .collect())
    }
}

#[async_trait]
impl ProfileStore for MemoryJournalStore {
    async fn create_profile(&self, profile: &UserProfile) -> Result<(), RecordError> {
        let mut profiles = self.profiles.write().unwrap();
        if profiles.contains_key(&profile.id) {
            return Err(RecordError::Other(format!(
                "duplicate profile id: {}",
                profile.id
            )));
        }
        profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn update_profile(&self, profile: &UserProfile) -> Result<(), RecordError> {
        let mut profiles = self.profiles.write().unwrap();
        if !profiles.contains_key(&profile.id) {
            return Err(RecordError::Other(format!(
                "no such profile: {}",
                profile.id
            )));
        }
        profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn find_profile(&self, id: &str) -> Result<Option<UserProfile>, RecordError> {
        let profiles = self.profiles.read().unwrap();
        Ok(profiles.get(id).cloned())
    }

    async fn find_profiles_by_owner(&self, owner: &str) -> Result<Vec<UserProfile>, RecordError> {
        let profiles = self.profiles.read().unwrap();
        let mut result: Vec<UserProfile> = profiles
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_date.cmp(&a.updated_date));
        Ok(result)
    }
}

#[async_trait]
impl SettingsStore for MemoryJournalStore {
    async fn find_settings(&self, owner: &str) -> Result<Option<ApiSettings>, RecordError> {
        let settings = self.settings.read().unwrap();
        Ok(settings.get(owner).cloned())
    }

    async fn upsert_settings(&self, value: &ApiSettings) -> Result<(), RecordError> {
        let mut settings = self.settings.write().unwrap();
        settings.insert(value.owner.clone(), value.clone());
        Ok(())
    }
}

#[async_trait]
impl TestRunStore for MemoryJournalStore {
    async fn create_test_run(&self, run: &TestRun) -> Result<(), RecordError> {
        let mut runs = self.test_runs.write().unwrap();
        runs.push(run.clone());
        Ok(())
    }

    async fn find_test_run(
        &self,
        owner: &str,
        profile_id: &str,
        test_run_id: &str,
    ) -> Result<Option<TestRun>, RecordError> {
        let runs = self.test_runs.read().unwrap();
        Ok(runs
            .iter()
            .find(|r| {
                r.owner == owner && r.profile_id == profile_id && r.test_run_id == test_run_id
            })
            .cloned())
    }
}
