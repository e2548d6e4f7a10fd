#![forbid(unsafe_code)]

//! Central concurrency ceiling for expensive gates.
//!
//! Both the request queue and the slot table live in the store, so the ceiling holds across
//! every worker process sharing the database. Duplicate requests (same job, migration
//! attempt and gate) collapse into the running or finished one.

use crate::clock::Clock;
use crate::gates::GateVerdict;
use crate::signature::verify_request_key;
use crate::{PipelineError, SharedStore, lock_store};
use serde::{Deserialize, Serialize};
use sm_core::ids::JobId;
use sm_core::model::Severity;
use sm_storage::{FindingRow, VerifyBegin, VerifyBeginRequest, VerifySlotRequest};
use std::sync::Arc;
use std::time::Duration;

/// Extra lifetime on queue entries and slots beyond the gate deadline.
const HOLD_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct LaneSettings {
    pub lane: String,
    pub capacity: u32,
    pub queue_wait: Duration,
    pub poll: Duration,
}

#[derive(Clone, Debug)]
pub struct VerifyTicket {
    pub job_id: JobId,
    pub migration_attempt: i64,
    pub gate_name: String,
    pub holder: String,
    /// Deadline of the gated work itself.
    pub deadline: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scheduled {
    /// The work ran under a slot held by this caller.
    Ran(GateVerdict),
    /// An earlier identical request already produced this verdict.
    Reused(GateVerdict),
    /// No slot (or no finished duplicate) within the queue wait.
    QueueTimeout,
}

#[derive(Serialize, Deserialize)]
struct StoredFinding {
    severity: String,
    location: Option<String>,
    message: String,
}

#[derive(Serialize, Deserialize)]
struct StoredVerdict {
    passed: bool,
    findings: Vec<StoredFinding>,
}

fn encode_verdict(verdict: &GateVerdict) -> Result<String, PipelineError> {
    let stored = StoredVerdict {
        passed: verdict.passed,
        findings: verdict
            .findings
            .iter()
            .map(|f| StoredFinding {
                severity: f.severity.as_str().to_string(),
                location: f.location.clone(),
                message: f.message.clone(),
            })
            .collect(),
    };
    serde_json::to_string(&stored).map_err(|err| PipelineError::Corrupt(err.to_string()))
}

fn decode_verdict(raw: &str) -> Result<GateVerdict, PipelineError> {
    let stored: StoredVerdict = serde_json::from_str(raw)
        .map_err(|err| PipelineError::Corrupt(format!("stored verdict: {err}")))?;
    Ok(GateVerdict {
        passed: stored.passed,
        findings: stored
            .findings
            .into_iter()
            .map(|f| FindingRow {
                severity: Severity::parse(&f.severity).unwrap_or(Severity::Error),
                location: f.location,
                message: f.message,
            })
            .collect(),
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct VerifyScheduler {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    settings: LaneSettings,
}

impl VerifyScheduler {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, settings: LaneSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LaneSettings {
        &self.settings
    }

    /// Runs `work` once a lane slot is free, or reuses the verdict of an identical request.
    pub fn run<F>(&self, ticket: &VerifyTicket, work: F) -> Result<Scheduled, PipelineError>
    where
        F: FnOnce() -> GateVerdict,
    {
        let key = verify_request_key(&ticket.job_id, ticket.migration_attempt, &ticket.gate_name);
        let hold_ms = millis(ticket.deadline.saturating_add(HOLD_MARGIN));
        let wait_until = self
            .clock
            .now_ms()
            .saturating_add(i64::try_from(self.settings.queue_wait.as_millis()).unwrap_or(i64::MAX));

        loop {
            let begin = lock_store(&self.store)?.verify_request_begin(VerifyBeginRequest {
                request_key: key.clone(),
                job_id: ticket.job_id.clone(),
                migration_attempt: ticket.migration_attempt,
                gate_name: ticket.gate_name.clone(),
                holder: ticket.holder.clone(),
                ttl_ms: hold_ms,
                now_ms: self.clock.now_ms(),
            })?;
            match begin {
                VerifyBegin::Acquired => break,
                VerifyBegin::Completed { result_json } => {
                    tracing::debug!(gate = %ticket.gate_name, job_id = %ticket.job_id, "reusing verdict");
                    return Ok(Scheduled::Reused(decode_verdict(&result_json)?));
                }
                VerifyBegin::InFlight { holder, .. } => {
                    if self.clock.now_ms() >= wait_until {
                        return Ok(Scheduled::QueueTimeout);
                    }
                    tracing::debug!(gate = %ticket.gate_name, %holder, "identical request in flight");
                    self.clock.sleep(self.settings.poll);
                }
            }
        }

        let slot = loop {
            let acquired = lock_store(&self.store)?.verify_slot_try_acquire(VerifySlotRequest {
                lane: self.settings.lane.clone(),
                capacity: self.settings.capacity,
                holder: ticket.holder.clone(),
                ttl_ms: hold_ms,
                now_ms: self.clock.now_ms(),
            })?;
            if let Some(slot) = acquired {
                break slot;
            }
            if self.clock.now_ms() >= wait_until {
                lock_store(&self.store)?.verify_request_abandon(&key, &ticket.holder)?;
                tracing::warn!(
                    gate = %ticket.gate_name,
                    job_id = %ticket.job_id,
                    lane = %self.settings.lane,
                    "verification lane saturated"
                );
                return Ok(Scheduled::QueueTimeout);
            }
            self.clock.sleep(self.settings.poll);
        };

        tracing::debug!(lane = %slot.lane, slot = slot.slot_index, gate = %ticket.gate_name, "slot acquired");
        let verdict = work();

        let mut store = lock_store(&self.store)?;
        let now_ms = self.clock.now_ms();
        store.verify_slot_release(&slot, now_ms)?;
        store.verify_request_complete(&key, &ticket.holder, &encode_verdict(&verdict)?, now_ms)?;
        Ok(Scheduled::Ran(verdict))
    }
}
