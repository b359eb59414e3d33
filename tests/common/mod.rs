//! Shared fixtures: in-memory store, manual clock and recording collaborators.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use deletion_gate::deletion::code::ConfirmationCode;
use deletion_gate::deletion::{
    ApprovalCoordinator, ApproverNotifier, AuditSink, Clock, CoordinatorSettings, ResourceEraser,
    ResourceInspector,
};
use deletion_gate::middleware::metrics::DeletionMetrics;
use deletion_gate::models::audit::AuditEvent;
use deletion_gate::models::deletion::{DeletionRequest, Resource};
use deletion_gate::store::memory::MemoryStore;

pub const HOUR: Duration = Duration::from_secs(3600);

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Captures every issued code so tests can play the approver.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, String, String)>>,
    unreachable: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn code_for(&self, request_id: Uuid, approver_id: &str) -> String {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, a, _)| *id == request_id && a == approver_id)
            .map(|(_, _, code)| code.clone())
            .unwrap_or_else(|| panic!("no code sent to {approver_id} for {request_id}"))
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn make_unreachable(&self, approver_id: &str) {
        self.unreachable.lock().unwrap().insert(approver_id.to_string());
    }

    /// Delivery to this approver never completes on its own.
    pub fn make_hanging(&self, approver_id: &str) {
        self.hanging.lock().unwrap().insert(approver_id.to_string());
    }
}

#[async_trait]
impl ApproverNotifier for RecordingNotifier {
    async fn notify(
        &self,
        approver_id: &str,
        request: &DeletionRequest,
        code: &ConfirmationCode,
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((
            request.id,
            approver_id.to_string(),
            code.as_str().to_string(),
        ));
        if self.unreachable.lock().unwrap().contains(approver_id) {
            anyhow::bail!("mailbox for {} unavailable", approver_id);
        }
        let hanging = self.hanging.lock().unwrap().contains(approver_id);
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn count(&self, action: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Environment double: tracks whether it holds data and counts erasures.
#[derive(Default)]
pub struct FakeEnvironments {
    has_data: AtomicBool,
    ingest_after_check: AtomicBool,
    erase_calls: AtomicUsize,
    failures_left: AtomicUsize,
    erase_delay: Mutex<Duration>,
    check_delay: Mutex<Duration>,
    erased: Mutex<HashSet<String>>,
}

impl FakeEnvironments {
    pub fn set_has_data(&self, has_data: bool) {
        self.has_data.store(has_data, Ordering::SeqCst);
    }

    /// The next emptiness check reports empty, then an event lands.
    pub fn ingest_after_next_check(&self) {
        self.ingest_after_check.store(true, Ordering::SeqCst);
    }

    /// Every emptiness check sleeps this long before answering.
    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock().unwrap() = delay;
    }

    /// Every erase call sleeps this long before doing its work.
    pub fn set_erase_delay(&self, delay: Duration) {
        *self.erase_delay.lock().unwrap() = delay;
    }

    /// Make the next `n` erase calls fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn erase_calls(&self) -> usize {
        self.erase_calls.load(Ordering::SeqCst)
    }

    pub fn is_erased(&self, resource_id: &str) -> bool {
        self.erased.lock().unwrap().contains(resource_id)
    }
}

#[async_trait]
impl ResourceInspector for FakeEnvironments {
    async fn has_dependents(&self, _resource: &Resource) -> anyhow::Result<bool> {
        let delay = *self.check_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let has_data = self.has_data.load(Ordering::SeqCst);
        if self.ingest_after_check.swap(false, Ordering::SeqCst) {
            self.has_data.store(true, Ordering::SeqCst);
        }
        Ok(has_data)
    }
}

#[async_trait]
impl ResourceEraser for FakeEnvironments {
    async fn erase(&self, resource: &Resource) -> anyhow::Result<()> {
        self.erase_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.erase_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection reset while deleting {}", resource.id);
        }
        self.erased.lock().unwrap().insert(resource.id.clone());
        Ok(())
    }

    async fn erase_if_empty(&self, resource: &Resource) -> anyhow::Result<bool> {
        if self.has_data.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.erase(resource).await.map(|()| true)
    }
}

pub struct Harness {
    pub coordinator: Arc<ApprovalCoordinator>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAudit>,
    pub envs: Arc<FakeEnvironments>,
}

impl Harness {
    /// A coordinator over an in-memory store whose environments hold data.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let audit = Arc::new(RecordingAudit::default());
        let envs = Arc::new(FakeEnvironments::default());
        envs.set_has_data(true);

        let coordinator = ApprovalCoordinator::new(
            store.clone(),
            envs.clone(),
            envs.clone(),
            notifier.clone(),
            audit.clone(),
            Arc::new(DeletionMetrics::new().unwrap()),
        )
        .with_clock(clock.clone())
        .with_settings(CoordinatorSettings {
            store_timeout: Duration::from_secs(1),
            erase_attempts: 2,
            erase_retry_delay: Duration::ZERO,
            erase_timeout: Duration::from_millis(500),
            notify_timeout: Duration::from_millis(200),
            ..CoordinatorSettings::default()
        });

        Self {
            coordinator: Arc::new(coordinator),
            store,
            clock,
            notifier,
            audit,
            envs,
        }
    }
}

pub fn approvers(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
