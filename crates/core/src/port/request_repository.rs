// Break Request Repository Port (Interface)

use crate::domain::{BreakRequest, RequestId};
use crate::error::Result;
use async_trait::async_trait;

/// Repository interface for BreakRequest persistence
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Insert a new request
    ///
    /// # Errors
    /// - `DomainError::DuplicateRequest` if the user already has a non-terminal
    ///   request in the same group
    async fn insert(&self, request: &BreakRequest) -> Result<()>;

    /// Overwrite a stored request
    ///
    /// # Errors
    /// - `AppError::NotFound` if the request was never inserted
    /// - `AppError::Database` if the stored request is already terminal
    async fn update(&self, request: &BreakRequest) -> Result<()>;

    /// Rewrite the queue keys of non-terminal requests in one atomic step
    async fn update_queue_keys(&self, keys: &[(RequestId, i64)]) -> Result<()>;

    /// Find request by ID
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<BreakRequest>>;

    /// All Waiting/Notified requests, oldest `enqueued_at` first
    async fn find_active(&self) -> Result<Vec<BreakRequest>>;

    /// Delete terminal requests resolved before `cutoff_millis`
    ///
    /// # Returns
    /// Number of requests deleted
    async fn delete_resolved_before(&self, cutoff_millis: i64) -> Result<u64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::DomainError;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard};

    /// HashMap-backed repository with write-failure injection
    #[derive(Default)]
    pub struct InMemoryRequestRepository {
        requests: Mutex<HashMap<RequestId, BreakRequest>>,
        fail_writes: AtomicBool,
    }

    impl InMemoryRequestRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent insert/update fail
        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub fn len(&self) -> usize {
            self.lock().map(|r| r.len()).unwrap_or(0)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Store a request as-is, bypassing every constraint
        pub fn seed(&self, request: BreakRequest) {
            if let Ok(mut requests) = self.lock() {
                requests.insert(request.id.clone(), request);
            }
        }

        fn lock(&self) -> Result<MutexGuard<'_, HashMap<RequestId, BreakRequest>>> {
            self.requests
                .lock()
                .map_err(|e| AppError::Internal(format!("repository lock poisoned: {}", e)))
        }

        fn check_writable(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(AppError::Database("injected write failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RequestRepository for InMemoryRequestRepository {
        async fn insert(&self, request: &BreakRequest) -> Result<()> {
            self.check_writable()?;
            let mut requests = self.lock()?;
            if requests.contains_key(&request.id) {
                return Err(AppError::Database(format!(
                    "Unique constraint violation: {}",
                    request.id
                )));
            }
            let duplicate = requests.values().any(|r| {
                r.user_id == request.user_id
                    && r.group == request.group
                    && !r.status.is_terminal()
            });
            if duplicate {
                return Err(DomainError::DuplicateRequest {
                    user_id: request.user_id.clone(),
                    group: request.group.clone(),
                }
                .into());
            }
            requests.insert(request.id.clone(), request.clone());
            Ok(())
        }

        async fn update_queue_keys(&self, keys: &[(RequestId, i64)]) -> Result<()> {
            self.check_writable()?;
            let mut requests = self.lock()?;
            for (id, key) in keys {
                if let Some(stored) = requests.get_mut(id) {
                    if !stored.status.is_terminal() {
                        stored.queue_key = *key;
                    }
                }
            }
            Ok(())
        }

        async fn update(&self, request: &BreakRequest) -> Result<()> {
            self.check_writable()?;
            let mut requests = self.lock()?;
            match requests.get(&request.id) {
                None => Err(AppError::NotFound(format!(
                    "Break request {} not found",
                    request.id
                ))),
                Some(stored) if stored.status.is_terminal() => Err(AppError::Database(format!(
                    "Cannot update break request {} from {} to {}",
                    request.id, stored.status, request.status
                ))),
                Some(_) => {
                    requests.insert(request.id.clone(), request.clone());
                    Ok(())
                }
            }
        }

        async fn find_by_id(&self, id: &RequestId) -> Result<Option<BreakRequest>> {
            Ok(self.lock()?.get(id).cloned())
        }

        async fn find_active(&self) -> Result<Vec<BreakRequest>> {
            let mut active: Vec<BreakRequest> = self
                .lock()?
                .values()
                .filter(|r| r.status.is_active())
                .cloned()
                .collect();
            active.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
            Ok(active)
        }

        async fn delete_resolved_before(&self, cutoff_millis: i64) -> Result<u64> {
            let mut requests = self.lock()?;
            let before = requests.len();
            requests.retain(|_, r| !matches!(r.resolved_at, Some(at) if at < cutoff_millis));
            Ok((before - requests.len()) as u64)
        }
    }
}
