use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use scheduler_domain::{
    Account, Allocation, Host, Project, ProjectFilter, ResourceRegistry,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Default)]
struct RegistryState {
    hosts: BTreeMap<i64, Host>,
    accounts: BTreeMap<i64, Account>,
    allocations: BTreeMap<i64, Allocation>,
    projects: BTreeMap<i64, Project>,
}

/// 内存资源注册表
///
/// 分配槽位的占用与释放在同一把锁内完成，并发放置不会超额占用。
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host(&self, host: Host) {
        self.state.lock().await.hosts.insert(host.id, host);
    }

    pub async fn add_account(&self, account: Account) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn add_allocation(&self, allocation: Allocation) {
        self.state
            .lock()
            .await
            .allocations
            .insert(allocation.id, allocation);
    }

    pub async fn add_project(&self, project: Project) {
        self.state.lock().await.projects.insert(project.id, project);
    }

    pub async fn set_host_active(&self, host_id: i64, active: bool) -> bool {
        match self.state.lock().await.hosts.get_mut(&host_id) {
            Some(host) => {
                host.active = active;
                true
            }
            None => false,
        }
    }

    pub async fn find_host_by_name(&self, name: &str) -> Option<Host> {
        self.state
            .lock()
            .await
            .hosts
            .values()
            .find(|h| h.name == name)
            .cloned()
    }

    pub async fn find_project_by_name(&self, name: &str) -> Option<Project> {
        self.state
            .lock()
            .await
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    pub async fn in_use(&self, allocation_id: i64) -> Option<u32> {
        self.state
            .lock()
            .await
            .allocations
            .get(&allocation_id)
            .map(|a| a.in_use)
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryRegistry {
    async fn list_projects(&self, filter: &ProjectFilter) -> SchedulerResult<Vec<Project>> {
        let state = self.state.lock().await;
        let projects = state
            .projects
            .values()
            .filter(|p| filter.matches_project(p))
            .filter(|p| match filter.host_id {
                Some(host_id) => p.allocation_ids.iter().any(|id| {
                    state
                        .allocations
                        .get(id)
                        .is_some_and(|a| a.host_id == host_id)
                }),
                None => true,
            })
            .cloned()
            .collect();
        Ok(projects)
    }

    async fn list_allocations(
        &self,
        project_id: i64,
        host_id: Option<i64>,
        active_only: bool,
    ) -> SchedulerResult<Vec<Allocation>> {
        let state = self.state.lock().await;
        let Some(project) = state.projects.get(&project_id) else {
            return Ok(Vec::new());
        };

        let allocations = project
            .allocation_ids
            .iter()
            .filter_map(|id| state.allocations.get(id))
            .filter(|a| host_id.is_none_or(|h| a.host_id == h))
            .filter(|a| !active_only || (a.active && a.has_capacity()))
            .cloned()
            .collect();
        Ok(allocations)
    }

    async fn derive_account(
        &self,
        allocation: &Allocation,
        user_filter: Option<&BTreeSet<i64>>,
    ) -> SchedulerResult<Option<Account>> {
        let state = self.state.lock().await;
        let account = state
            .accounts
            .values()
            .filter(|a| a.host_id == allocation.host_id)
            .filter(|a| allocation.user_ids.is_empty() || allocation.user_ids.contains(&a.user_id))
            .find(|a| user_filter.is_none_or(|users| users.contains(&a.user_id)))
            .cloned();

        if account.is_none() {
            debug!("分配 {} 没有可用账户", allocation.name);
        }
        Ok(account)
    }

    async fn get_host(&self, id: i64) -> SchedulerResult<Option<Host>> {
        Ok(self.state.lock().await.hosts.get(&id).cloned())
    }

    async fn get_account(&self, id: i64) -> SchedulerResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn get_allocation(&self, id: i64) -> SchedulerResult<Option<Allocation>> {
        Ok(self.state.lock().await.allocations.get(&id).cloned())
    }

    async fn get_project(&self, id: i64) -> SchedulerResult<Option<Project>> {
        Ok(self.state.lock().await.projects.get(&id).cloned())
    }

    async fn try_claim(&self, allocation_id: i64) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&allocation_id)
            .ok_or_else(|| SchedulerError::resource_not_found("分配", allocation_id))?;

        if !allocation.active || !allocation.has_capacity() {
            return Ok(false);
        }
        allocation.in_use += 1;
        debug!(
            "占用分配 {} 槽位: {}/{}",
            allocation.name, allocation.in_use, allocation.capacity
        );
        Ok(true)
    }

    async fn release(&self, allocation_id: i64) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let allocation = state
            .allocations
            .get_mut(&allocation_id)
            .ok_or_else(|| SchedulerError::resource_not_found("分配", allocation_id))?;

        if allocation.in_use == 0 {
            warn!("分配 {} 没有被占用的槽位可释放", allocation.name);
            return Ok(());
        }
        allocation.in_use -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host(id: i64, name: &str) -> Host {
        Host {
            id,
            name: name.to_string(),
            address: format!("{name}.example.edu"),
            ppn: 8,
            template_name: name.to_string(),
            active: true,
            queue_system: Default::default(),
            binaries: Default::default(),
            default_binary: None,
        }
    }

    fn allocation(id: i64, host_id: i64, capacity: u32) -> Allocation {
        Allocation {
            id,
            name: format!("alloc{id}"),
            key: format!("key{id}"),
            host_id,
            active: true,
            capacity,
            in_use: 0,
            user_ids: BTreeSet::from([1]),
            serial_walltime_seconds: None,
        }
    }

    fn account(id: i64, user_id: i64, host_id: i64) -> Account {
        Account {
            id,
            user_id,
            host_id,
            username: format!("user{user_id}"),
            run_path: PathBuf::from("/scratch"),
        }
    }

    async fn registry() -> InMemoryRegistry {
        let registry = InMemoryRegistry::new();
        registry.add_host(host(1, "quest")).await;
        registry.add_host(host(2, "edison")).await;
        registry.add_allocation(allocation(10, 1, 2)).await;
        registry.add_allocation(allocation(20, 2, 1)).await;
        registry.add_account(account(100, 1, 1)).await;
        registry.add_account(account(101, 2, 1)).await;
        registry
            .add_project(Project {
                id: 1,
                name: "oqmd".to_string(),
                priority: 0,
                state: Default::default(),
                active: true,
                user_ids: BTreeSet::from([1]),
                allocation_ids: BTreeSet::from([10, 20]),
            })
            .await;
        registry
            .add_project(Project {
                id: 2,
                name: "idle".to_string(),
                priority: 0,
                state: Default::default(),
                active: false,
                user_ids: BTreeSet::new(),
                allocation_ids: BTreeSet::from([10]),
            })
            .await;
        registry
    }

    #[tokio::test]
    async fn test_list_projects_filters() {
        let registry = registry().await;

        let all = registry.list_projects(&ProjectFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let schedulable = registry
            .list_projects(&ProjectFilter::default().schedulable())
            .await
            .unwrap();
        assert_eq!(schedulable.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);

        let on_edison = registry
            .list_projects(&ProjectFilter::default().with_host(2))
            .await
            .unwrap();
        assert_eq!(on_edison.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);

        let none = registry
            .list_projects(&ProjectFilter::among(&BTreeSet::from([9])))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_list_allocations() {
        let registry = registry().await;

        assert_eq!(registry.list_allocations(1, None, true).await.unwrap().len(), 2);
        let on_quest = registry.list_allocations(1, Some(1), true).await.unwrap();
        assert_eq!(on_quest.len(), 1);
        assert_eq!(on_quest[0].id, 10);
        assert!(registry.list_allocations(99, None, true).await.unwrap().is_empty());

        assert!(registry.try_claim(20).await.unwrap());
        assert_eq!(registry.list_allocations(1, Some(2), true).await.unwrap().len(), 0);
        assert_eq!(registry.list_allocations(1, Some(2), false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_derive_account_respects_user_filter() {
        let registry = registry().await;
        let alloc = registry.get_allocation(10).await.unwrap().unwrap();

        let account = registry.derive_account(&alloc, None).await.unwrap().unwrap();
        assert_eq!(account.id, 100);

        let none = registry
            .derive_account(&alloc, Some(&BTreeSet::from([2])))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let registry = registry().await;
        assert!(registry.try_claim(10).await.unwrap());
        assert!(registry.try_claim(10).await.unwrap());
        assert!(!registry.try_claim(10).await.unwrap());
        assert_eq!(registry.in_use(10).await, Some(2));

        registry.release(10).await.unwrap();
        assert_eq!(registry.in_use(10).await, Some(1));
        registry.release(10).await.unwrap();
        registry.release(10).await.unwrap();
        assert_eq!(registry.in_use(10).await, Some(0));

        assert!(registry.try_claim(999).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_exceed_capacity() {
        let registry = registry().await;
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.try_claim(10).await })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(registry.in_use(10).await, Some(2));
    }
}
