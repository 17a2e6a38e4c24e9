//! Correlation table for client-issued requests.
//!
//! Owned by the connection loop; nothing else touches it. Ids come from a
//! monotonically increasing counter and are never reused. Ids whose calls
//! timed out or were cancelled stay quarantined for a while so a late reply
//! can be recognised and discarded instead of being reported as unsolicited.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use lsprobe_types::{ClientError, RequestId};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How many resolved ids to remember for duplicate detection.
const RESOLVED_HISTORY: usize = 1024;

const MAX_QUARANTINE: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) type Reply = Result<Value, ClientError>;

#[derive(Debug)]
pub(crate) struct PendingCall {
    pub method: String,
    pub timeout: Option<Duration>,
    deadline: Option<Instant>,
    tx: oneshot::Sender<Reply>,
}

impl PendingCall {
    /// Resolve the call. A caller that stopped waiting is not an error.
    pub fn resolve(self, reply: Reply) {
        let _ = self.tx.send(reply);
    }
}

/// What a response id refers to.
#[derive(Debug)]
pub(crate) enum Lookup {
    Outstanding(PendingCall),
    /// Cancelled or timed out, still inside the quarantine window.
    Late { method: String },
    /// Already resolved by an earlier response.
    Duplicate { method: String },
    Unknown,
}

#[derive(Debug)]
pub(crate) struct PendingTable {
    next_id: i64,
    calls: HashMap<i64, PendingCall>,
    deadlines: BinaryHeap<Reverse<(Instant, i64)>>,
    quarantine: HashMap<i64, (String, Instant)>,
    resolved: VecDeque<(i64, String)>,
    quarantine_window: Duration,
}

impl PendingTable {
    pub fn new(quarantine_window: Duration) -> Self {
        Self {
            next_id: 1,
            calls: HashMap::new(),
            deadlines: BinaryHeap::new(),
            quarantine: HashMap::new(),
            resolved: VecDeque::new(),
            quarantine_window: quarantine_window.min(MAX_QUARANTINE),
        }
    }

    /// Allocate an id and register the call under it.
    pub fn insert(
        &mut self,
        method: &str,
        timeout: Option<Duration>,
        tx: oneshot::Sender<Reply>,
    ) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        // Durations too large to represent mean no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        if let Some(deadline) = deadline {
            self.deadlines.push(Reverse((deadline, id)));
        }
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                timeout,
                deadline,
                tx,
            },
        );
        id
    }

    /// Remove a call that was registered but never made it onto the wire.
    pub fn forget(&mut self, id: i64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Claim the call a response belongs to.
    pub fn take_for_response(&mut self, id: &RequestId) -> Lookup {
        let Some(id) = id.as_number() else {
            return Lookup::Unknown;
        };
        if let Some(call) = self.calls.remove(&id) {
            self.remember_resolved(id, &call.method);
            return Lookup::Outstanding(call);
        }
        self.prune_quarantine(Instant::now());
        if let Some((method, _)) = self.quarantine.get(&id) {
            return Lookup::Late {
                method: method.clone(),
            };
        }
        if let Some((_, method)) = self.resolved.iter().find(|(resolved, _)| *resolved == id) {
            return Lookup::Duplicate {
                method: method.clone(),
            };
        }
        Lookup::Unknown
    }

    /// Remove a call on cancellation and quarantine its id.
    pub fn cancel(&mut self, id: i64) -> Option<PendingCall> {
        let call = self.calls.remove(&id)?;
        self.quarantine_id(id, &call.method);
        Some(call)
    }

    /// Earliest deadline still belonging to an outstanding call.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.is_live_deadline(id, deadline) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Remove every call whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(i64, PendingCall)> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if !self.is_live_deadline(id, deadline) {
                continue;
            }
            if let Some(call) = self.calls.remove(&id) {
                self.quarantine_id(id, &call.method);
                expired.push((id, call));
            }
        }
        expired
    }

    /// Resolve every outstanding call with `error`.
    pub fn fail_all(&mut self, error: &ClientError) {
        for (_, call) in self.calls.drain() {
            call.resolve(Err(error.clone()));
        }
        self.deadlines.clear();
    }

    pub fn outstanding_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<i64> = self.calls.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(RequestId::Number).collect()
    }

    fn is_live_deadline(&self, id: i64, deadline: Instant) -> bool {
        self.calls
            .get(&id)
            .is_some_and(|call| call.deadline == Some(deadline))
    }

    fn quarantine_id(&mut self, id: i64, method: &str) {
        let now = Instant::now();
        self.prune_quarantine(now);
        self.quarantine
            .insert(id, (method.to_string(), now + self.quarantine_window));
    }

    fn prune_quarantine(&mut self, now: Instant) {
        self.quarantine.retain(|_, (_, expires)| *expires > now);
    }

    fn remember_resolved(&mut self, id: i64, method: &str) {
        if self.resolved.len() == RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back((id, method.to_string()));
    }
}
