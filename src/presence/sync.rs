//! Queue presence synchronizer.
//!
//! Applying a status walks every queue of the agent independently: a queue
//! that fails is reported and skipped, the rest still converge. The declared
//! status is recorded once all queues have been attempted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{
    AgentPresence, PresenceStatus, PresenceStore, QueueControl, QueueDirectory, QueueMembership,
};
use crate::error::{PresenceError, QueueActionError};

/// One queue that could not be brought in line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFailure {
    pub queue: String,
    pub error: String,
}

/// Outcome of applying a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub status: PresenceStatus,
    pub synced: Vec<String>,
    pub failures: Vec<QueueFailure>,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct QueuePresenceSync {
    presence: Mutex<AgentPresence>,
    directory: Arc<dyn QueueDirectory>,
    control: Arc<dyn QueueControl>,
    store: Arc<dyn PresenceStore>,
}

impl QueuePresenceSync {
    pub fn new(
        agent_id: impl Into<String>,
        directory: Arc<dyn QueueDirectory>,
        control: Arc<dyn QueueControl>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        Self {
            presence: Mutex::new(AgentPresence::at_login(agent_id)),
            directory,
            control,
            store,
        }
    }

    pub fn presence(&self) -> AgentPresence {
        self.presence.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bring every queue of the agent in line with `status`, then record it.
    ///
    /// Fails only when the agent's queues cannot be resolved or the status
    /// cannot be stored; per-queue problems end up in the report.
    pub async fn apply(&self, status: PresenceStatus) -> Result<SyncReport, PresenceError> {
        let agent_id = self.presence().agent_id;
        let agent = self.directory.agent_queues(&agent_id).await?;
        let rows: HashMap<String, QueueMembership> = self
            .directory
            .memberships(&agent.interface)
            .await?
            .into_iter()
            .map(|row| (row.queue_name.clone(), row))
            .collect();

        let mut report = SyncReport {
            status: status.clone(),
            synced: Vec::new(),
            failures: Vec::new(),
        };
        for queue in &agent.queues {
            match self
                .sync_queue(queue, &agent.interface, rows.get(queue), &status)
                .await
            {
                Ok(()) => report.synced.push(queue.clone()),
                Err(error) => {
                    tracing::warn!("Queue {} not synced to {}: {}", queue, status, error);
                    report.failures.push(QueueFailure {
                        queue: queue.clone(),
                        error,
                    });
                }
            }
        }

        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status = status.clone();
        self.store.save(&status).await?;

        tracing::info!(
            "Presence {} applied to {}/{} queues",
            status,
            report.synced.len(),
            agent.queues.len()
        );
        Ok(report)
    }

    async fn sync_queue(
        &self,
        queue: &str,
        interface: &str,
        row: Option<&QueueMembership>,
        status: &PresenceStatus,
    ) -> Result<(), String> {
        let paused = status.is_paused();
        let reason = status.pause_reason();

        match row {
            None => {
                let row = QueueMembership::new(queue, interface, status);
                self.directory
                    .create_membership(&row)
                    .await
                    .map_err(|e| e.to_string())?;
                self.add_member(queue, interface, status).await?;
            }
            Some(row) => {
                if !row.mirrors(status) {
                    let mut updated = row.clone();
                    updated.paused = paused;
                    updated.pause_reason = reason.map(str::to_string);
                    self.directory
                        .update_membership(&updated)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }

        match self.control.pause_member(queue, interface, paused, reason).await {
            Ok(()) => Ok(()),
            // Row exists but the switch lost the member; put it back.
            Err(QueueActionError::NotMember) => self.add_member(queue, interface, status).await,
            Err(e) => Err(e.to_string()),
        }
    }

    async fn add_member(&self, queue: &str, interface: &str, status: &PresenceStatus) -> Result<(), String> {
        match self
            .control
            .add_member(queue, interface, status.is_paused(), status.pause_reason())
            .await
        {
            Ok(()) | Err(QueueActionError::AlreadyMember) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Remove the agent from every queue. Failures are logged and returned,
    /// never raised.
    pub async fn teardown(&self) -> Vec<QueueFailure> {
        let agent_id = self.presence().agent_id;
        let mut failures = Vec::new();

        let interface = match self.directory.agent_queues(&agent_id).await {
            Ok(agent) => agent.interface,
            Err(e) => {
                tracing::warn!("Queue teardown skipped: {}", e);
                self.reset();
                return failures;
            }
        };
        let rows = match self.directory.memberships(&interface).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Queue teardown skipped: {}", e);
                self.reset();
                return failures;
            }
        };

        for row in rows {
            let removed = match self.control.remove_member(&row.queue_name, &interface).await {
                Ok(()) | Err(QueueActionError::NotMember) => Ok(()),
                Err(e) => Err(e.to_string()),
            };
            let deleted = self
                .directory
                .delete_membership(&row)
                .await
                .map_err(|e| e.to_string());

            if let Err(error) = removed.and(deleted) {
                tracing::warn!("Leaving queue {} failed: {}", row.queue_name, error);
                failures.push(QueueFailure {
                    queue: row.queue_name.clone(),
                    error,
                });
            }
        }

        self.reset();
        tracing::info!("Left all queues for {}", interface);
        failures
    }

    fn reset(&self) {
        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status = PresenceStatus::OffQueue;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::presence::{AgentQueues, StatusRecord};
    use async_trait::async_trait;

    /// Directory, switch and store in one, sharing the membership table.
    #[derive(Default)]
    pub struct FakeBackend {
        pub queues: Vec<String>,
        pub rows: Mutex<Vec<QueueMembership>>,
        /// Members as the switch sees them: queue -> (paused, reason)
        pub switch: Mutex<HashMap<String, (bool, Option<String>)>>,
        pub refuse_queue: Option<String>,
        pub stored: Mutex<Option<StatusRecord>>,
        pub actions: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        pub fn with_queues(queues: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                queues: queues.iter().map(|q| q.to_string()).collect(),
                ..Default::default()
            })
        }

        fn row(&self, queue: &str) -> Option<QueueMembership> {
            self.rows.lock().unwrap().iter().find(|r| r.queue_name == queue).cloned()
        }
    }

    #[async_trait]
    impl QueueDirectory for FakeBackend {
        async fn agent_queues(&self, _: &str) -> Result<AgentQueues, PresenceError> {
            Ok(AgentQueues {
                interface: "PJSIP/1001".into(),
                queues: self.queues.clone(),
            })
        }
        async fn memberships(&self, _: &str) -> Result<Vec<QueueMembership>, PresenceError> {
            Ok(self.rows.lock().unwrap().clone())
        }
        async fn create_membership(&self, row: &QueueMembership) -> Result<QueueMembership, PresenceError> {
            let mut row = row.clone();
            row.id = Some(format!("m-{}", row.queue_name));
            self.rows.lock().unwrap().push(row.clone());
            Ok(row)
        }
        async fn update_membership(&self, row: &QueueMembership) -> Result<(), PresenceError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows.iter_mut().find(|r| r.queue_name == row.queue_name) {
                *existing = row.clone();
            }
            Ok(())
        }
        async fn delete_membership(&self, row: &QueueMembership) -> Result<(), PresenceError> {
            self.rows.lock().unwrap().retain(|r| r.queue_name != row.queue_name);
            Ok(())
        }
    }

    #[async_trait]
    impl QueueControl for FakeBackend {
        async fn add_member(&self, queue: &str, _: &str, paused: bool, reason: Option<&str>) -> Result<(), QueueActionError> {
            self.actions.lock().unwrap().push(format!("add {}", queue));
            if self.refuse_queue.as_deref() == Some(queue) {
                return Err(QueueActionError::Rejected("Unable to add interface: No such queue".into()));
            }
            let mut switch = self.switch.lock().unwrap();
            if switch.contains_key(queue) {
                return Err(QueueActionError::AlreadyMember);
            }
            switch.insert(queue.to_string(), (paused, reason.map(str::to_string)));
            Ok(())
        }
        async fn remove_member(&self, queue: &str, _: &str) -> Result<(), QueueActionError> {
            self.actions.lock().unwrap().push(format!("remove {}", queue));
            match self.switch.lock().unwrap().remove(queue) {
                Some(_) => Ok(()),
                None => Err(QueueActionError::NotMember),
            }
        }
        async fn pause_member(&self, queue: &str, _: &str, paused: bool, reason: Option<&str>) -> Result<(), QueueActionError> {
            self.actions.lock().unwrap().push(format!("pause {} {}", queue, paused));
            match self.switch.lock().unwrap().get_mut(queue) {
                Some(member) => {
                    *member = (paused, reason.map(str::to_string));
                    Ok(())
                }
                None => Err(QueueActionError::NotMember),
            }
        }
    }

    #[async_trait]
    impl PresenceStore for FakeBackend {
        async fn save(&self, status: &PresenceStatus) -> Result<(), PresenceError> {
            *self.stored.lock().unwrap() = Some(StatusRecord::from_status(status));
            Ok(())
        }
        async fn load(&self) -> Result<StatusRecord, PresenceError> {
            self.stored
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| PresenceError::Store("no status".into()))
        }
    }

    fn sync_for(backend: &Arc<FakeBackend>) -> QueuePresenceSync {
        QueuePresenceSync::new("agent-7", backend.clone(), backend.clone(), backend.clone())
    }

    fn lunch() -> PresenceStatus {
        PresenceStatus::Break {
            id: 3,
            name: "Lunch".into(),
        }
    }

    fn assert_mirrors(backend: &FakeBackend, status: &PresenceStatus) {
        for queue in &backend.queues {
            let row = backend.row(queue).unwrap();
            assert!(row.mirrors(status), "row for {} does not mirror {}", queue, status);
            let switch = backend.switch.lock().unwrap();
            let (paused, reason) = switch.get(queue).unwrap();
            assert_eq!(*paused, status.is_paused());
            assert_eq!(reason.as_deref(), status.pause_reason());
        }
    }

    #[tokio::test]
    async fn test_break_pauses_every_queue() {
        let backend = FakeBackend::with_queues(&["sales", "support"]);
        let sync = sync_for(&backend);

        let report = sync.apply(lunch()).await.unwrap();
        assert!(!report.is_partial());
        assert_eq!(report.synced, vec!["sales", "support"]);
        assert_mirrors(&backend, &lunch());

        let record = backend.load().await.unwrap();
        assert_eq!(record.current_status, "Lunch");
        assert_eq!(record.break_id, Some(3));
        assert_eq!(sync.presence().status, lunch());
    }

    #[tokio::test]
    async fn test_ready_unpauses_and_clears_reason() {
        let backend = FakeBackend::with_queues(&["sales", "support"]);
        let sync = sync_for(&backend);
        sync.apply(lunch()).await.unwrap();

        sync.apply(PresenceStatus::Ready).await.unwrap();
        assert_mirrors(&backend, &PresenceStatus::Ready);
        assert_eq!(backend.load().await.unwrap().current_status, "Ready");
    }

    #[tokio::test]
    async fn test_reapplying_is_idempotent() {
        let backend = FakeBackend::with_queues(&["sales"]);
        let sync = sync_for(&backend);

        sync.apply(PresenceStatus::OffQueue).await.unwrap();
        let rows_before = backend.rows.lock().unwrap().clone();
        let report = sync.apply(PresenceStatus::OffQueue).await.unwrap();

        assert!(!report.is_partial());
        assert_eq!(*backend.rows.lock().unwrap(), rows_before);
        assert_mirrors(&backend, &PresenceStatus::OffQueue);
        let adds = backend
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.starts_with("add"))
            .count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn test_already_member_counts_as_success() {
        let backend = FakeBackend::with_queues(&["sales"]);
        backend
            .switch
            .lock()
            .unwrap()
            .insert("sales".into(), (false, None));
        let sync = sync_for(&backend);

        let report = sync.apply(lunch()).await.unwrap();
        assert!(!report.is_partial());
        assert_mirrors(&backend, &lunch());
    }

    #[tokio::test]
    async fn test_failing_queue_does_not_block_others() {
        let backend = Arc::new(FakeBackend {
            queues: vec!["sales".into(), "billing".into(), "support".into()],
            refuse_queue: Some("billing".into()),
            ..Default::default()
        });
        let sync = sync_for(&backend);

        let report = sync.apply(lunch()).await.unwrap();
        assert!(report.is_partial());
        assert_eq!(report.synced, vec!["sales", "support"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].queue, "billing");
        assert!(report.failures[0].error.contains("No such queue"));

        // Status is still recorded.
        assert_eq!(backend.load().await.unwrap().current_status, "Lunch");
    }

    #[tokio::test]
    async fn test_member_lost_by_switch_is_re_added() {
        let backend = FakeBackend::with_queues(&["sales"]);
        let sync = sync_for(&backend);
        sync.apply(PresenceStatus::Ready).await.unwrap();

        backend.switch.lock().unwrap().clear();
        let report = sync.apply(lunch()).await.unwrap();
        assert!(!report.is_partial());
        assert_mirrors(&backend, &lunch());
    }

    #[tokio::test]
    async fn test_teardown_removes_everything() {
        let backend = FakeBackend::with_queues(&["sales", "support"]);
        let sync = sync_for(&backend);
        sync.apply(PresenceStatus::Ready).await.unwrap();
        // Switch already dropped one member; still not a failure.
        backend.switch.lock().unwrap().remove("support");

        let failures = sync.teardown().await;
        assert!(failures.is_empty());
        assert!(backend.rows.lock().unwrap().is_empty());
        assert!(backend.switch.lock().unwrap().is_empty());
        assert_eq!(sync.presence().status, PresenceStatus::OffQueue);
    }
}
