//! Notification log and bounded expectations.
//!
//! A [`Harness`] subscribes to a client as soon as it is built and records
//! every notification and connection event in arrival order. Expectations
//! then wait on that record, never longer than [`MAX_WAIT`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lsprobe_lsp::{ClientEvent, LspClient};
use lsprobe_types::{Anomaly, Notification};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::HarnessError;
use crate::matching::json_matches;

/// Upper bound on any single harness wait.
pub const MAX_WAIT: Duration = Duration::from_secs(10 * 60);

/// Which notifications an expectation may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectMode {
    /// Only notifications that arrive after the expectation starts.
    #[default]
    Next,
    /// Anything recorded since the harness started, or arriving later.
    Eventually,
}

#[derive(Default)]
struct Record {
    notifications: Vec<Notification>,
    events: Vec<ClientEvent>,
}

pub struct Harness {
    client: LspClient,
    record: Arc<Mutex<Record>>,
    /// Bumped after every append so waiters can rescan.
    seq: watch::Receiver<u64>,
    recorder: JoinHandle<()>,
}

impl Harness {
    /// Start recording. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(client: LspClient) -> Self {
        let notifications = client.subscribe_notifications();
        let events = client.subscribe_events();
        let record = Arc::new(Mutex::new(Record::default()));
        let (seq_tx, seq) = watch::channel(0);
        let recorder = tokio::spawn(record_loop(notifications, events, record.clone(), seq_tx));
        Self {
            client,
            record,
            seq,
            recorder,
        }
    }

    pub fn client(&self) -> &LspClient {
        &self.client
    }

    /// Wait for a notification of `method` satisfying `predicate`.
    pub async fn expect_notification<P>(
        &self,
        method: &str,
        predicate: P,
        timeout: Duration,
        mode: ExpectMode,
    ) -> Result<Notification, HarnessError>
    where
        P: Fn(&Notification) -> bool,
    {
        check_wait(timeout)?;
        let matches = |n: &Notification| n.method == method && predicate(n);
        let found = match mode {
            ExpectMode::Next => self.next_matching(matches, timeout).await,
            ExpectMode::Eventually => {
                self.wait_in_record(
                    |record| record.notifications.iter().find(|n| matches(n)).cloned(),
                    timeout,
                )
                .await
            }
        };
        found.ok_or_else(|| HarnessError::ExpectationTimeout {
            what: format!("`{method}` notification"),
            after: timeout,
        })
    }

    /// [`expect_notification`](Self::expect_notification) matching params
    /// structurally against `expected`.
    pub async fn expect_notification_params(
        &self,
        method: &str,
        expected: &Value,
        timeout: Duration,
        mode: ExpectMode,
    ) -> Result<Notification, HarnessError> {
        self.expect_notification(
            method,
            |n| json_matches(n.params_or_null(), expected),
            timeout,
            mode,
        )
        .await
    }

    /// Wait until an anomaly satisfying `predicate` has been recorded.
    pub async fn expect_anomaly<P>(
        &self,
        predicate: P,
        timeout: Duration,
    ) -> Result<Anomaly, HarnessError>
    where
        P: Fn(&Anomaly) -> bool,
    {
        check_wait(timeout)?;
        self.wait_in_record(
            |record| {
                record.events.iter().find_map(|event| match event {
                    ClientEvent::Anomaly(anomaly) if predicate(anomaly) => Some(anomaly.clone()),
                    _ => None,
                })
            },
            timeout,
        )
        .await
        .ok_or_else(|| HarnessError::ExpectationTimeout {
            what: "protocol anomaly".into(),
            after: timeout,
        })
    }

    /// Every notification recorded so far, in arrival order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    pub fn notifications_for(&self, method: &str) -> Vec<Notification> {
        self.lock()
            .notifications
            .iter()
            .filter(|n| n.method == method)
            .cloned()
            .collect()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::Anomaly(anomaly) => Some(anomaly.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.lock().events.clone()
    }

    /// Toggle reporting of notifications no handler claims.
    pub fn set_strict(&self, strict: bool) -> Result<(), HarnessError> {
        Ok(self.client.set_strict_notifications(strict)?)
    }

    async fn next_matching(
        &self,
        matches: impl Fn(&Notification) -> bool,
        timeout: Duration,
    ) -> Option<Notification> {
        let mut rx = self.client.subscribe_notifications();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(n) if matches(&n) => return Some(n),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "expectation fell behind the notification stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    async fn wait_in_record<T>(
        &self,
        find: impl Fn(&Record) -> Option<T>,
        timeout: Duration,
    ) -> Option<T> {
        let mut seq = self.seq.clone();
        let wait = async {
            loop {
                seq.borrow_and_update();
                if let Some(found) = find(&self.lock()) {
                    return Some(found);
                }
                if seq.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.recorder.abort();
    }
}

fn check_wait(timeout: Duration) -> Result<(), HarnessError> {
    if timeout > MAX_WAIT {
        return Err(HarnessError::InvalidWait {
            requested: timeout,
            max: MAX_WAIT,
        });
    }
    Ok(())
}

async fn record_loop(
    mut notifications: broadcast::Receiver<Notification>,
    mut events: broadcast::Receiver<ClientEvent>,
    record: Arc<Mutex<Record>>,
    seq: watch::Sender<u64>,
) {
    let push = |f: &dyn Fn(&mut Record)| {
        f(&mut record.lock().unwrap_or_else(PoisonError::into_inner));
        seq.send_modify(|n| *n += 1);
    };
    let mut notifications_open = true;
    let mut events_open = true;
    while notifications_open || events_open {
        tokio::select! {
            received = notifications.recv(), if notifications_open => match received {
                Ok(n) => push(&|r| r.notifications.push(n.clone())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "harness dropped notifications");
                }
                Err(broadcast::error::RecvError::Closed) => notifications_open = false,
            },
            received = events.recv(), if events_open => match received {
                Ok(event) => push(&|r| r.events.push(event.clone())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "harness dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }
    }
}
