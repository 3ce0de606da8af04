use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use interface::CoreError;

use crate::record::{ProfileStore, UserProfile};

/// 소유자당 프로필 최대 개수
pub const MAX_PROFILES: usize = 5;

/// 자동 생성되는 기본 프로필의 시작 잔고 (USD)
pub const DEFAULT_STARTING_BALANCE: f64 = 10_000.0;

/// 소유자 기준 활성 프로필 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    /// 활성 프로필 없음
    ZeroActive,
    /// 활성 프로필이 2개 이상
    MultiActive(usize),
    /// 정확히 1개 활성 (치유된 상태)
    Healed,
}

/// "소유자당 활성 프로필 정확히 1개" 불변식을 유지하는 관리자.
///
/// 활성 프로필을 프로세스 상태로 들고 있지 않는다 — 매 호출마다
/// 저장소를 읽고, 필요하면 결정적으로 복구(heal)한다. 잠금은 없으며
/// 동시 호출의 안전성은 복구 함수의 멱등성에서 나온다.
pub struct ProfileIntegrityManager {
    store: Arc<dyn ProfileStore>,
}

impl ProfileIntegrityManager {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// 현재 상태 관찰 (복구하지 않음)
    pub async fn observe_state(&self, owner: &str) -> Result<ProfileState, CoreError> {
        let profiles = self.store.find_profiles_by_owner(owner).await?;
        Ok(state_of(&profiles))
    }

    /// 불변식 복구 후 활성 프로필 반환
    ///
    /// - ZeroActive → 가장 최근에 수정된 프로필을 활성화
    /// - MultiActive → 가장 최근에 수정된 활성 프로필만 남기고 나머지 비활성화
    ///
    /// 프로필이 하나도 없으면 NoActiveProfile.
    pub async fn ensure_healed(&self, owner: &str) -> Result<UserProfile, CoreError> {
        // find_profiles_by_owner는 updated_date 내림차순
        let profiles = self.store.find_profiles_by_owner(owner).await?;
        if profiles.is_empty() {
            return Err(CoreError::NoActiveProfile);
        }

        let active: Vec<&UserProfile> = profiles.iter().filter(|p| p.is_active).collect();

        match active.len() {
            1 => Ok(active[0].clone()),
            0 => {
                // 가장 최근에 수정된 프로필을 활성화
                warn!(owner, "no active profile, healing");
                let mut chosen = profiles[0].clone();
                chosen.is_active = true;
                chosen.updated_date = Utc::now();
                self.store.update_profile(&chosen).await?;
                Ok(chosen)
            }
            n => {
                // 가장 최근에 수정된 활성 프로필만 남긴다
                warn!(owner, active_count = n, "multiple active profiles, healing");
                let keep = active[0].clone();
                for profile in active.into_iter().skip(1) {
                    let mut deactivated = profile.clone();
                    deactivated.is_active = false;
                    deactivated.updated_date = Utc::now();
                    self.store.update_profile(&deactivated).await?;
                }
                Ok(keep)
            }
        }
    }

    /// 활성 프로필 조회 (기회주의적 복구 포함)
    pub async fn active_profile(&self, owner: &str) -> Result<UserProfile, CoreError> {
        self.ensure_healed(owner).await
    }

    /// 첫 로그인 시 기본 프로필 자동 생성
    /// 이미 프로필이 있으면 복구만 수행한다.
    pub async fn ensure_default_profile(
        &self,
        owner: &str,
        starting_balance: f64,
    ) -> Result<UserProfile, CoreError> {
        let profiles = self.store.find_profiles_by_owner(owner).await?;
        if !profiles.is_empty() {
            return self.ensure_healed(owner).await;
        }

        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            is_active: true,
            profile_name: "Default".to_string(),
            starting_balance,
            updated_date: Utc::now(),
        };
        self.store.create_profile(&profile).await?;
        info!(owner, profile_id = %profile.id, "created default profile");
        Ok(profile)
    }

    /// 새 프로필 생성 (소유자당 최대 5개)
    /// 소유자의 첫 프로필이면 활성 상태로 생성된다.
    pub async fn create_profile(
        &self,
        owner: &str,
        name: &str,
        starting_balance: f64,
    ) -> Result<UserProfile, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("profile_name is required".to_string()));
        }

        let existing = self.store.find_profiles_by_owner(owner).await?;
        if existing.len() >= MAX_PROFILES {
            return Err(CoreError::ProfileLimitReached(MAX_PROFILES));
        }

        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            is_active: existing.is_empty(),
            profile_name: name.to_string(),
            starting_balance,
            updated_date: Utc::now(),
        };
        self.store.create_profile(&profile).await?;
        Ok(profile)
    }

    /// 원자적 의도의 프로필 전환: 소유자의 모든 프로필을 비활성화한 뒤
    /// target을 활성화하고, 다시 읽어서 activeCount == 1을 검증한다.
    /// 검증에 실패하면 IntegrityViolation.
    pub async fn switch(&self, owner: &str, target_id: &str) -> Result<UserProfile, CoreError> {
        let target = self
            .store
            .find_profile(target_id)
            .await?
            .filter(|p| p.owner == owner)
            .ok_or_else(|| CoreError::NotFound(format!("profile {}", target_id)))?;

        // 1단계: 소유자의 모든 프로필 비활성화
        let profiles = self.store.find_profiles_by_owner(owner).await?;
        for profile in &profiles {
            if profile.is_active {
                let mut deactivated = profile.clone();
                deactivated.is_active = false;
                deactivated.updated_date = Utc::now();
                self.store.update_profile(&deactivated).await?;
            }
        }

        // 2단계: target 활성화
        let mut activated = target;
        activated.is_active = true;
        activated.updated_date = Utc::now();
        self.store.update_profile(&activated).await?;

        // 3단계: 사후 검증 — 트랜잭션이 없으므로 다시 읽어서 확인한다
        let after = self.store.find_profiles_by_owner(owner).await?;
        let active: Vec<&UserProfile> = after.iter().filter(|p| p.is_active).collect();
        if active.len() != 1 || active[0].id != activated.id {
            return Err(CoreError::IntegrityViolation {
                owner: owner.to_string(),
                active_count: active.len(),
            });
        }

        info!(owner, profile_id = %activated.id, "switched active profile");
        Ok(activated)
    }
}

fn state_of(profiles: &[UserProfile]) -> ProfileState {
    match profiles.iter().filter(|p| p.is_active).count() {
        0 => ProfileState::ZeroActive,
        1 => ProfileState::Healed,
        n => ProfileState::MultiActive(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryJournalStore;
    use chrono::{Duration, Utc};

    fn profile(id: &str, owner: &str, active: bool, updated_offset_s: i64) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            owner: owner.to_string(),
            is_active: active,
            profile_name: format!("profile-{}", id),
            starting_balance: 10000.0,
            updated_date: Utc::now() - Duration::seconds(1000 - updated_offset_s),
        }
    }

    async fn manager_with(profiles: Vec<UserProfile>) -> (ProfileIntegrityManager, Arc<MemoryJournalStore>) {
        let store = Arc::new(MemoryJournalStore::new());
        for p in &profiles {
            store.create_profile(p).await.unwrap();
        }
        (ProfileIntegrityManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_heal_zero_active_activates_most_recent() {
        let (manager, store) = manager_with(vec![
            profile("a", "user1", false, 10),
            profile("b", "user1", false, 30),
            profile("c", "user1", false, 20),
        ])
        .await;

        let healed = manager.ensure_healed("user1").await.unwrap();
        assert_eq!(healed.id, "b");

        let after = store.find_profiles_by_owner("user1").await.unwrap();
        assert_eq!(after.iter().filter(|p| p.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_heal_multi_active_keeps_most_recent() {
        // 서로 다른 updated_date를 가진 활성 프로필 3개
        let (manager, store) = manager_with(vec![
            profile("a", "user1", true, 10),
            profile("b", "user1", true, 30),
            profile("c", "user1", true, 20),
        ])
        .await;

        let healed = manager.ensure_healed("user1").await.unwrap();
        assert_eq!(healed.id, "b");

        let after = store.find_profiles_by_owner("user1").await.unwrap();
        let active: Vec<_> = after.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");
    }

    #[tokio::test]
    async fn test_heal_is_idempotent() {
        let (manager, _) = manager_with(vec![
            profile("a", "user1", true, 10),
            profile("b", "user1", true, 30),
        ])
        .await;

        let first = manager.ensure_healed("user1").await.unwrap();
        let second = manager.ensure_healed("user1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            manager.observe_state("user1").await.unwrap(),
            ProfileState::Healed
        );
    }

    #[tokio::test]
    async fn test_no_profiles_is_no_active_profile() {
        let (manager, _) = manager_with(vec![]).await;
        let err = manager.ensure_healed("user1").await.unwrap_err();
        assert_eq!(err.error_code(), "NO_ACTIVE_PROFILE");
    }

    #[tokio::test]
    async fn test_switch_leaves_exactly_target_active() {
        let (manager, store) = manager_with(vec![
            profile("a", "user1", true, 10),
            profile("b", "user1", false, 20),
            profile("c", "user1", false, 30),
        ])
        .await;

        let switched = manager.switch("user1", "b").await.unwrap();
        assert_eq!(switched.id, "b");

        let after = store.find_profiles_by_owner("user1").await.unwrap();
        let active: Vec<_> = after.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");
    }

    #[tokio::test]
    async fn test_switch_rejects_foreign_profile() {
        let (manager, _) = manager_with(vec![
            profile("a", "user1", true, 10),
            profile("x", "user2", true, 10),
        ])
        .await;

        let err = manager.switch("user1", "x").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_profile_limit() {
        let (manager, _) = manager_with(vec![
            profile("a", "user1", true, 1),
            profile("b", "user1", false, 2),
            profile("c", "user1", false, 3),
            profile("d", "user1", false, 4),
            profile("e", "user1", false, 5),
        ])
        .await;

        let err = manager
            .create_profile("user1", "sixth", 10000.0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PROFILE_LIMIT_REACHED");
    }

    #[tokio::test]
    async fn test_first_profile_is_created_active() {
        let (manager, _) = manager_with(vec![]).await;
        let created = manager
            .create_profile("user1", "first", 5000.0)
            .await
            .unwrap();
        assert!(created.is_active);

        let second = manager
            .create_profile("user1", "second", 5000.0)
            .await
            .unwrap();
        assert!(!second.is_active);
    }

    #[tokio::test]
    async fn test_ensure_default_profile_auto_provisions_once() {
        let (manager, store) = manager_with(vec![]).await;
        let first = manager.ensure_default_profile("user1", 10000.0).await.unwrap();
        let second = manager.ensure_default_profile("user1", 10000.0).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.find_profiles_by_owner("user1").await.unwrap().len(), 1);
    }
}
