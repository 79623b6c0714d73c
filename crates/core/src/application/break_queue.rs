//! Break Queue - per-group break request lifecycle
//!
//! Every mutation of a group runs under that group's mutex. A transition is
//! computed on a copy, written through the repository, and only then committed
//! to the in-memory queue, so a failed write leaves the queue untouched.

use crate::config::QueueConfig;
use crate::domain::{
    validate_group, validate_user_id, BreakRequest, BreakStatus, DomainError, GroupId,
    GroupQueue, RequestId,
};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, RequestRepository, TimeProvider};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

type GroupHandle = Arc<Mutex<GroupQueue>>;
type GroupGuard = OwnedMutexGuard<GroupQueue>;

/// Break request queue service
pub struct BreakQueue {
    repo: Arc<dyn RequestRepository>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    config: QueueConfig,
    // Non-empty groups only. An entry is removed under its own lock once empty.
    groups: RwLock<HashMap<GroupId, GroupHandle>>,
    // Active request -> owning group. Written only while holding that group's lock.
    index: RwLock<HashMap<RequestId, GroupId>>,
}

impl BreakQueue {
    pub fn new(
        repo: Arc<dyn RequestRepository>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        config: QueueConfig,
    ) -> Self {
        Self {
            repo,
            id_provider,
            time_provider,
            config,
            groups: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a break request for `user_id` at the tail of `group`
    ///
    /// # Errors
    /// - `DomainError::Validation` for malformed identifiers
    /// - `DomainError::DuplicateRequest` if the user already has an active request in the group
    pub async fn enqueue(&self, user_id: &str, group: &str) -> Result<BreakRequest> {
        validate_user_id(user_id)?;
        validate_group(group)?;

        let mut queue = self.lock_group(group).await;

        if queue.active_for_user(user_id).is_some() {
            return Err(DomainError::DuplicateRequest {
                user_id: user_id.to_string(),
                group: group.to_string(),
            }
            .into());
        }

        let mut request = BreakRequest::new(
            self.id_provider.generate_id(),
            user_id,
            group,
            self.time_provider.now_millis(),
        );
        request.queue_key = queue.tail_key();
        if let Err(e) = self.repo.insert(&request).await {
            self.release_if_empty(&queue).await;
            return Err(e);
        }

        queue.push_waiting(request.clone());
        self.index
            .write()
            .await
            .insert(request.id.clone(), group.to_string());

        info!(
            request_id = %request.id,
            user_id = %user_id,
            group = %group,
            position = queue.waiting_len() - 1,
            "Break request enqueued"
        );
        Ok(request)
    }

    /// Notify the head of the group's Waiting sequence
    ///
    /// Returns `None` when nobody is waiting (or the group is unknown).
    pub async fn notify_next(&self, group: &str) -> Result<Option<BreakRequest>> {
        let Some(handle) = self.existing_group(group).await else {
            return Ok(None);
        };
        let mut queue = handle.lock().await;

        let head = queue.peek_waiting().cloned();
        let Some(mut updated) = head else {
            debug!(group = %group, "No waiting break request to notify");
            return Ok(None);
        };

        updated.notify(self.time_provider.now_millis())?;
        let updated = self.commit(&mut queue, updated).await?;
        Ok(Some(updated))
    }

    /// Notified -> Confirmed
    pub async fn confirm(&self, request_id: &str) -> Result<BreakRequest> {
        self.transition(request_id, BreakStatus::Confirmed, |request, now| {
            request.confirm(now)
        })
        .await
    }

    /// Notified -> Postponed -> Waiting, reinserted behind the current head
    pub async fn postpone(&self, request_id: &str) -> Result<BreakRequest> {
        self.transition(request_id, BreakStatus::Postponed, |request, _| {
            request.postpone()?;
            request.requeue()
        })
        .await
    }

    /// Notified -> Expired, once the expiry window has elapsed
    ///
    /// # Errors
    /// - `DomainError::NotYetExpirable` before the window has elapsed
    /// - `DomainError::InvalidTransition` if the request is not Notified
    pub async fn expire(&self, request_id: &str) -> Result<BreakRequest> {
        let window_ms = self.config.expiry_window_ms;
        self.transition(request_id, BreakStatus::Expired, move |request, now| {
            request.expire(now, window_ms)
        })
        .await
    }

    /// Any non-terminal status -> Cancelled
    pub async fn cancel(&self, request_id: &str) -> Result<BreakRequest> {
        self.transition(request_id, BreakStatus::Cancelled, |request, now| {
            request.cancel(now)
        })
        .await
    }

    /// Look up a request, active or resolved
    pub async fn get(&self, request_id: &str) -> Result<BreakRequest> {
        if let Some(handle) = self.locate(request_id).await {
            if let Some(request) = handle.lock().await.get(request_id) {
                return Ok(request.clone());
            }
        }
        self.repo
            .find_by_id(&request_id.to_string())
            .await?
            .ok_or_else(|| not_found(request_id))
    }

    /// Ordered active sequence of a group (Notified first, then Waiting)
    pub async fn sequence(&self, group: &str) -> Vec<BreakRequest> {
        match self.existing_group(group).await {
            Some(handle) => handle.lock().await.sequence(),
            None => Vec::new(),
        }
    }

    /// Zero-based position of a Waiting request in its group
    pub async fn position(&self, request_id: &str) -> Option<usize> {
        let handle = self.locate(request_id).await?;
        let queue = handle.lock().await;
        queue.waiting_position(request_id)
    }

    /// Groups with in-memory state, sorted by name
    pub async fn groups(&self) -> Vec<GroupId> {
        let mut names: Vec<GroupId> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Expire every Notified request whose window has elapsed
    ///
    /// A failed write is logged and the request stays Notified for the next sweep.
    pub async fn sweep_expired(&self) -> Result<Vec<BreakRequest>> {
        let handles: Vec<GroupHandle> = self.groups.read().await.values().cloned().collect();
        let window_ms = self.config.expiry_window_ms;
        let mut expired = Vec::new();

        for handle in handles {
            let mut queue = handle.lock().await;
            let now = self.time_provider.now_millis();
            let due: Vec<BreakRequest> = queue
                .notified()
                .filter(|r| r.is_expirable(now, window_ms))
                .cloned()
                .collect();

            for mut request in due {
                request.expire(now, window_ms)?;
                match self.commit(&mut queue, request).await {
                    Ok(request) => expired.push(request),
                    Err(e) => warn!(
                        group = %queue.group(),
                        error = %e,
                        "Failed to expire break request, retrying next sweep"
                    ),
                }
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expiry sweep completed");
        }
        Ok(expired)
    }

    /// Delete resolved requests older than the retention period
    pub async fn purge_resolved(&self) -> Result<u64> {
        let cutoff = self.time_provider.now_millis() - self.config.resolved_retention_ms;
        let deleted = self.repo.delete_resolved_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted = deleted, cutoff = cutoff, "Purged resolved break requests");
        }
        Ok(deleted)
    }

    /// Rebuild in-memory queues from the repository's active requests
    ///
    /// Requests already tracked are skipped. Notified requests keep their
    /// notification order and Waiting requests their stored queue keys. A second
    /// active request for a user already tracked in the group is skipped.
    ///
    /// # Returns
    /// Number of requests restored
    pub async fn restore(&self) -> Result<usize> {
        let mut active = self.repo.find_active().await?;
        active.sort_by_key(|r| (r.enqueued_at, r.id.clone()));
        active.sort_by_key(|r| (r.status != BreakStatus::Notified, r.notified_at));

        let mut restored = 0;
        for request in active {
            let mut queue = self.lock_group(&request.group).await;
            if queue.get(&request.id).is_some() {
                continue;
            }
            if let Some(kept) = queue.active_for_user(&request.user_id) {
                warn!(
                    request_id = %request.id,
                    kept_request_id = %kept.id,
                    user_id = %request.user_id,
                    group = %request.group,
                    "Skipping second active break request for user"
                );
                continue;
            }
            let (id, group) = (request.id.clone(), request.group.clone());
            if queue.restore(request) {
                self.index.write().await.insert(id, group);
                restored += 1;
            } else {
                self.release_if_empty(&queue).await;
            }
        }

        info!(restored = restored, "Break queue restored from repository");
        Ok(restored)
    }

    /// Run a status transition on an active request
    async fn transition<F>(
        &self,
        request_id: &str,
        to: BreakStatus,
        step: F,
    ) -> Result<BreakRequest>
    where
        F: FnOnce(&mut BreakRequest, i64) -> crate::domain::error::Result<()>,
    {
        let Some(handle) = self.locate(request_id).await else {
            return Err(self.inactive_error(request_id, to).await);
        };
        let mut queue = handle.lock().await;

        // Resolved between index lookup and lock
        let current = queue.get(request_id).cloned();
        let Some(mut updated) = current else {
            drop(queue);
            return Err(self.inactive_error(request_id, to).await);
        };

        step(&mut updated, self.time_provider.now_millis())?;
        self.commit(&mut queue, updated).await
    }

    /// Persist a transitioned request, then place it in the group queue
    async fn commit(
        &self,
        queue: &mut GroupQueue,
        mut updated: BreakRequest,
    ) -> Result<BreakRequest> {
        if updated.status == BreakStatus::Waiting {
            let slot = queue.reinsertion_slot(&updated.id, self.config.reinsertion_shift);
            if !slot.renumbered.is_empty() {
                // Renumbering keeps the relative order of everyone else
                self.repo.update_queue_keys(&slot.renumbered).await?;
                queue.apply_queue_keys(&slot.renumbered);
                debug!(
                    group = %queue.group(),
                    renumbered = slot.renumbered.len(),
                    "Renumbered waiting break requests"
                );
            }
            updated.queue_key = slot.queue_key;
        }

        self.repo.update(&updated).await?;

        match updated.status {
            BreakStatus::Notified => {
                queue.mark_notified(updated.clone());
                info!(
                    request_id = %updated.id,
                    user_id = %updated.user_id,
                    group = %updated.group,
                    "Break request notified"
                );
            }
            BreakStatus::Waiting => {
                let position = queue.insert_by_key(updated.clone());
                info!(
                    request_id = %updated.id,
                    user_id = %updated.user_id,
                    group = %updated.group,
                    postpone_count = updated.postpone_count,
                    position = position,
                    "Break request postponed"
                );
            }
            status => {
                queue.remove(&updated.id);
                self.index.write().await.remove(&updated.id);
                self.release_if_empty(queue).await;
                info!(
                    request_id = %updated.id,
                    user_id = %updated.user_id,
                    group = %updated.group,
                    status = %status,
                    "Break request resolved"
                );
            }
        }
        Ok(updated)
    }

    /// Error for a transition on a request that is not active in memory
    async fn inactive_error(&self, request_id: &str, to: BreakStatus) -> AppError {
        match self.repo.find_by_id(&request_id.to_string()).await {
            Ok(Some(stored)) if !stored.status.is_terminal() => AppError::Internal(format!(
                "Break request {} is {} in storage but not loaded; restore the queue first",
                request_id, stored.status
            )),
            Ok(Some(stored)) => DomainError::InvalidTransition {
                from: stored.status.to_string(),
                to: to.to_string(),
            }
            .into(),
            Ok(None) => not_found(request_id),
            Err(e) => e,
        }
    }

    async fn locate(&self, request_id: &str) -> Option<GroupHandle> {
        let group = self.index.read().await.get(request_id).cloned()?;
        self.existing_group(&group).await
    }

    async fn existing_group(&self, group: &str) -> Option<GroupHandle> {
        self.groups.read().await.get(group).cloned()
    }

    /// Lock the group's queue, creating it if needed
    ///
    /// Retries when the handle was released between lookup and lock.
    async fn lock_group(&self, group: &str) -> GroupGuard {
        loop {
            let handle = match self.existing_group(group).await {
                Some(handle) => handle,
                None => self
                    .groups
                    .write()
                    .await
                    .entry(group.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(GroupQueue::new(group))))
                    .clone(),
            };
            let guard = handle.clone().lock_owned().await;

            let current = self.groups.read().await.get(group).cloned();
            if current.is_some_and(|c| Arc::ptr_eq(&c, &handle)) {
                return guard;
            }
        }
    }

    /// Forget an empty group. Caller holds the group's lock.
    async fn release_if_empty(&self, queue: &GroupQueue) {
        if queue.is_empty() {
            self.groups.write().await.remove(queue.group());
        }
    }
}

fn not_found(request_id: &str) -> AppError {
    AppError::NotFound(format!("Break request {} not found", request_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::request_repository::mocks::InMemoryRequestRepository;
    use crate::port::time_provider::mocks::MockTimeProvider;

    struct Fixture {
        queue: Arc<BreakQueue>,
        repo: Arc<InMemoryRequestRepository>,
        clock: Arc<MockTimeProvider>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRequestRepository::new());
        let clock = Arc::new(MockTimeProvider::new(1_000_000));
        let queue = Arc::new(BreakQueue::new(
            repo.clone(),
            Arc::new(SequentialIdProvider::new()),
            clock.clone(),
            QueueConfig::default(),
        ));
        Fixture { queue, repo, clock }
    }

    fn users(sequence: &[BreakRequest]) -> Vec<&str> {
        sequence.iter().map(|r| r.user_id.as_str()).collect()
    }

    fn domain_err(err: &AppError) -> &DomainError {
        err.as_domain().expect("expected a domain error")
    }

    #[tokio::test]
    async fn test_enqueue_notify_confirm_scenario() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.enqueue("U2", "A").await.unwrap();
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U1", "U2"]);

        let notified = f.queue.notify_next("A").await.unwrap().unwrap();
        assert_eq!(notified.id, r1.id);
        assert_eq!(notified.status, BreakStatus::Notified);
        assert_eq!(notified.notified_at, Some(1_000_000));

        let confirmed = f.queue.confirm(&r1.id).await.unwrap();
        assert_eq!(confirmed.status, BreakStatus::Confirmed);
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U2"]);

        // Persisted as resolved
        let stored = f.repo.find_by_id(&r1.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BreakStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let f = fixture();
        f.queue.enqueue("U1", "A").await.unwrap();

        let err = f.queue.enqueue("U1", "A").await.unwrap_err();
        assert!(matches!(
            domain_err(&err),
            DomainError::DuplicateRequest { .. }
        ));

        // Still a duplicate while Notified
        f.queue.notify_next("A").await.unwrap();
        assert!(f.queue.enqueue("U1", "A").await.is_err());

        // Other groups are independent
        assert!(f.queue.enqueue("U1", "B").await.is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_allowed_again_after_resolution() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.cancel(&r1.id).await.unwrap();

        let r2 = f.queue.enqueue("U1", "A").await.unwrap();
        assert_ne!(r1.id, r2.id);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let f = fixture();
        let err = f.queue.enqueue("", "A").await.unwrap_err();
        assert!(matches!(domain_err(&err), DomainError::Validation(_)));

        let err = f.queue.enqueue("U1", "bad group").await.unwrap_err();
        assert!(matches!(domain_err(&err), DomainError::Validation(_)));
        assert!(f.queue.groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_notify_next_empty() {
        let f = fixture();
        assert!(f.queue.notify_next("unknown").await.unwrap().is_none());

        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        assert!(f.queue.notify_next("A").await.unwrap().is_some());
        // Only request is already Notified
        assert!(f.queue.notify_next("A").await.unwrap().is_none());
        assert_eq!(f.queue.get(&r1.id).await.unwrap().status, BreakStatus::Notified);
    }

    #[tokio::test]
    async fn test_postpone_reinserts_two_behind_head() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        for user in ["U2", "U3", "U4"] {
            f.queue.enqueue(user, "A").await.unwrap();
        }

        f.queue.notify_next("A").await.unwrap();
        let postponed = f.queue.postpone(&r1.id).await.unwrap();

        assert_eq!(postponed.status, BreakStatus::Waiting);
        assert_eq!(postponed.postpone_count, 1);
        assert!(postponed.notified_at.is_none());
        assert_eq!(
            users(&f.queue.sequence("A").await),
            vec!["U2", "U3", "U1", "U4"]
        );
        assert_eq!(f.queue.position(&r1.id).await, Some(2));
    }

    #[tokio::test]
    async fn test_postpone_single_request_returns_to_head() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();

        let postponed = f.queue.postpone(&r1.id).await.unwrap();
        assert_eq!(postponed.postpone_count, 1);
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U1"]);
        assert_eq!(f.queue.position(&r1.id).await, Some(0));

        // Can be notified and postponed again
        f.queue.notify_next("A").await.unwrap();
        let again = f.queue.postpone(&r1.id).await.unwrap();
        assert_eq!(again.postpone_count, 2);
    }

    #[tokio::test]
    async fn test_postpone_with_one_other_waiting() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.enqueue("U2", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();

        f.queue.postpone(&r1.id).await.unwrap();
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U2", "U1"]);
    }

    #[tokio::test]
    async fn test_expire_respects_window() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();

        f.clock.advance(89_000);
        let err = f.queue.expire(&r1.id).await.unwrap_err();
        assert_eq!(
            domain_err(&err),
            &DomainError::NotYetExpirable { remaining_ms: 1000 }
        );
        assert_eq!(f.queue.get(&r1.id).await.unwrap().status, BreakStatus::Notified);

        f.clock.advance(2_000);
        let expired = f.queue.expire(&r1.id).await.unwrap();
        assert_eq!(expired.status, BreakStatus::Expired);
        assert!(f.queue.sequence("A").await.is_empty());

        // Second expire has no effect
        let err = f.queue.expire(&r1.id).await.unwrap_err();
        assert!(matches!(
            domain_err(&err),
            DomainError::InvalidTransition { .. }
        ));
        let stored = f.queue.get(&r1.id).await.unwrap();
        assert_eq!(stored.resolved_at, Some(1_091_000));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();

        for err in [
            f.queue.confirm(&r1.id).await.unwrap_err(),
            f.queue.postpone(&r1.id).await.unwrap_err(),
            f.queue.expire(&r1.id).await.unwrap_err(),
        ] {
            assert!(matches!(
                domain_err(&err),
                DomainError::InvalidTransition { .. }
            ));
        }
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U1"]);
    }

    #[tokio::test]
    async fn test_resolved_request_rejects_transitions() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();
        f.queue.confirm(&r1.id).await.unwrap();

        let err = f.queue.cancel(&r1.id).await.unwrap_err();
        assert_eq!(
            domain_err(&err),
            &DomainError::InvalidTransition {
                from: "CONFIRMED".to_string(),
                to: "CANCELLED".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_waiting_and_notified() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        let r2 = f.queue.enqueue("U2", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();

        assert_eq!(
            f.queue.cancel(&r2.id).await.unwrap().status,
            BreakStatus::Cancelled
        );
        assert_eq!(
            f.queue.cancel(&r1.id).await.unwrap().status,
            BreakStatus::Cancelled
        );
        assert!(f.queue.sequence("A").await.is_empty());
        assert_eq!(f.queue.position(&r2.id).await, None);
    }

    #[tokio::test]
    async fn test_unknown_request_not_found() {
        let f = fixture();
        for err in [
            f.queue.confirm("nope").await.unwrap_err(),
            f.queue.cancel("nope").await.unwrap_err(),
            f.queue.get("nope").await.unwrap_err(),
        ] {
            assert!(matches!(err, AppError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_queue_unchanged() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.repo.set_fail_writes(true);

        assert!(matches!(
            f.queue.notify_next("A").await.unwrap_err(),
            AppError::Database(_)
        ));
        assert!(f.queue.enqueue("U2", "A").await.is_err());
        assert_eq!(f.queue.get(&r1.id).await.unwrap().status, BreakStatus::Waiting);
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U1"]);

        f.repo.set_fail_writes(false);
        assert!(f.queue.notify_next("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_expires_only_due_requests() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        let r2 = f.queue.enqueue("U2", "B").await.unwrap();
        f.queue.enqueue("U3", "A").await.unwrap();

        f.queue.notify_next("A").await.unwrap();
        f.clock.advance(30_000);
        f.queue.notify_next("B").await.unwrap();

        f.clock.advance(60_000); // r1 at 90s, r2 at 60s
        let expired = f.queue.sweep_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, r1.id);
        assert_eq!(users(&f.queue.sequence("A").await), vec!["U3"]);

        // Nothing new is due: sweeping again changes nothing
        assert!(f.queue.sweep_expired().await.unwrap().is_empty());
        assert_eq!(f.queue.get(&r2.id).await.unwrap().status, BreakStatus::Notified);
    }

    #[tokio::test]
    async fn test_purge_resolved_respects_retention() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        let r2 = f.queue.enqueue("U2", "A").await.unwrap();
        f.queue.cancel(&r1.id).await.unwrap();

        f.clock.advance(f.queue.config().resolved_retention_ms + 1);
        assert_eq!(f.queue.purge_resolved().await.unwrap(), 1);
        assert!(matches!(
            f.queue.get(&r1.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        // Active requests survive
        assert_eq!(f.queue.get(&r2.id).await.unwrap().status, BreakStatus::Waiting);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_sequences() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.clock.advance(10);
        f.queue.enqueue("U2", "A").await.unwrap();
        f.clock.advance(10);
        f.queue.enqueue("U3", "B").await.unwrap();
        f.queue.notify_next("A").await.unwrap();

        let restarted = BreakQueue::new(
            f.repo.clone(),
            Arc::new(SequentialIdProvider::new()),
            f.clock.clone(),
            QueueConfig::default(),
        );
        assert_eq!(restarted.restore().await.unwrap(), 3);
        assert_eq!(restarted.groups().await, vec!["A", "B"]);
        assert_eq!(users(&restarted.sequence("A").await), vec!["U1", "U2"]);

        // Restored Notified request can be confirmed
        let confirmed = restarted.confirm(&r1.id).await.unwrap();
        assert_eq!(confirmed.status, BreakStatus::Confirmed);

        // Second restore is a no-op for tracked requests
        assert_eq!(restarted.restore().await.unwrap(), 0);
    }

    fn restarted(f: &Fixture) -> BreakQueue {
        BreakQueue::new(
            f.repo.clone(),
            Arc::new(SequentialIdProvider::new()),
            f.clock.clone(),
            QueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_restore_keeps_postponed_position() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        for user in ["U2", "U3", "U4"] {
            f.clock.advance(10);
            f.queue.enqueue(user, "A").await.unwrap();
        }
        f.queue.notify_next("A").await.unwrap();
        f.queue.postpone(&r1.id).await.unwrap();
        let before = users(&f.queue.sequence("A").await)
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        assert_eq!(before, vec!["U2", "U3", "U1", "U4"]);

        let queue = restarted(&f);
        assert_eq!(queue.restore().await.unwrap(), 4);
        assert_eq!(users(&queue.sequence("A").await), before);
        assert_eq!(queue.position(&r1.id).await, Some(2));
    }

    #[tokio::test]
    async fn test_restore_after_many_postpones() {
        let f = fixture();
        for i in 0..5 {
            f.queue.enqueue(&format!("U{}", i), "A").await.unwrap();
        }
        // Enough cycles to exhaust the key gap behind the head
        for _ in 0..40 {
            let head = f.queue.notify_next("A").await.unwrap().unwrap();
            f.queue.postpone(&head.id).await.unwrap();
        }
        let before: Vec<String> = f
            .queue
            .sequence("A")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();

        let queue = restarted(&f);
        queue.restore().await.unwrap();
        let after: Vec<String> = queue
            .sequence("A")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_restore_orders_notified_by_notification_time() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        f.queue.enqueue("U2", "A").await.unwrap();
        f.queue.enqueue("U3", "A").await.unwrap();
        f.queue.notify_next("A").await.unwrap();
        f.queue.postpone(&r1.id).await.unwrap();
        f.clock.advance(10);
        f.queue.notify_next("A").await.unwrap(); // U2
        f.clock.advance(10);
        f.queue.notify_next("A").await.unwrap(); // U3
        let before = f.queue.sequence("A").await;

        let queue = restarted(&f);
        queue.restore().await.unwrap();
        assert_eq!(queue.sequence("A").await, before);
        assert_eq!(users(&before), vec!["U2", "U3", "U1"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejected_by_storage_before_restore() {
        let f = fixture();
        f.queue.enqueue("U1", "A").await.unwrap();

        let queue = restarted(&f);
        let err = queue.enqueue("U1", "A").await.unwrap_err();
        assert!(matches!(
            domain_err(&err),
            DomainError::DuplicateRequest { .. }
        ));
        assert!(queue.groups().await.is_empty());
        assert_eq!(f.repo.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_skips_second_active_request_for_user() {
        let f = fixture();
        let first = BreakRequest::new("req-a", "U1", "A", 10);
        let mut second = BreakRequest::new("req-b", "U1", "A", 20);
        second.queue_key = 1;
        f.repo.seed(first.clone());
        f.repo.seed(second);
        f.repo.seed(BreakRequest::new("req-c", "U2", "A", 30));

        assert_eq!(f.queue.restore().await.unwrap(), 2);
        let sequence = f.queue.sequence("A").await;
        assert_eq!(users(&sequence), vec!["U1", "U2"]);
        assert_eq!(sequence[0].id, first.id);
    }

    #[tokio::test]
    async fn test_empty_groups_are_released() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();
        let r2 = f.queue.enqueue("U2", "B").await.unwrap();
        f.queue.notify_next("B").await.unwrap();

        f.queue.cancel(&r1.id).await.unwrap();
        f.queue.confirm(&r2.id).await.unwrap();
        assert!(f.queue.groups().await.is_empty());

        // Failed insert does not leave an empty group behind
        f.repo.set_fail_writes(true);
        assert!(f.queue.enqueue("U3", "C").await.is_err());
        assert!(f.queue.groups().await.is_empty());
        f.repo.set_fail_writes(false);

        // A released group comes back on the next enqueue
        f.queue.enqueue("U1", "A").await.unwrap();
        assert_eq!(f.queue.groups().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_and_resolution_keep_group_tracked() {
        let f = fixture();
        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = f.queue.clone();
            handles.push(tokio::spawn(async move {
                let request = queue.enqueue(&format!("U{}", i), "A").await?;
                if i % 2 == 0 {
                    queue.cancel(&request.id).await?;
                }
                Ok::<_, AppError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sequence = f.queue.sequence("A").await;
        assert_eq!(sequence.len(), 10);
        assert_eq!(f.queue.groups().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_unloaded_request_reports_missing_restore() {
        let f = fixture();
        let r1 = f.queue.enqueue("U1", "A").await.unwrap();

        let queue = restarted(&f);
        let err = queue.cancel(&r1.id).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(err.to_string().contains("restore"));

        queue.restore().await.unwrap();
        assert_eq!(
            queue.cancel(&r1.id).await.unwrap().status,
            BreakStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_concurrent_notify_never_pops_twice() {
        let f = fixture();
        for i in 0..20 {
            f.queue.enqueue(&format!("U{}", i), "A").await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..30 {
            let queue = f.queue.clone();
            handles.push(tokio::spawn(async move { queue.notify_next("A").await }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            if let Some(request) = handle.await.unwrap().unwrap() {
                ids.push(request.id);
            }
        }
        assert_eq!(ids.len(), 20);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20, "No request should be notified twice");
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_same_user_single_winner() {
        let f = fixture();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let queue = f.queue.clone();
            handles.push(tokio::spawn(async move { queue.enqueue("U1", "A").await }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(f.queue.sequence("A").await.len(), 1);
    }
}
