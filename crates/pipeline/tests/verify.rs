#![forbid(unsafe_code)]

mod support;
use support::*;

use sm_core::ids::{JobId, WorkerId};
use sm_core::model::{GateStatus, Phase};
use sm_pipeline::clock::{Clock, SystemClock};
use sm_pipeline::gates::{BuildGate, Gate, TIMEOUT_FINDING_PREFIX};
use sm_pipeline::lease::HeldLease;
use sm_pipeline::model::ProjectSnapshot;
use sm_pipeline::SharedStore;
use sm_pipeline::orchestrator::{Orchestrator, RunOutcome, StepOutcome};
use sm_pipeline::phases::{DeployResult, VerifyReport};
use sm_pipeline::progress::EVENT_GATE_RESULT;
use sm_pipeline::services::{
    BuildReport, ProgressEvent, ProgressSink, ProjectBuilder, ServiceError, Services,
};
use sm_pipeline::verify_scheduler::{LaneSettings, VerifyScheduler};
use sm_storage::{GateResultRow, VerifySlotRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn statuses(rows: &[GateResultRow]) -> Vec<(&str, GateStatus)> {
    rows.iter()
        .map(|row| (row.gate_name.as_str(), row.status))
        .collect()
}

#[test]
fn blocking_typecheck_failure_delivers_degraded() {
    let h = Harness::new(test_config());
    h.fakes.checker.project_fails.store(true, Ordering::SeqCst);
    let job_id = h.submit();

    let outcome = h.orchestrator("w1").run_job(&job_id).expect("run");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));

    let gates = h
        .store
        .lock()
        .expect("store")
        .gate_results_latest(&job_id)
        .expect("gate results");
    assert_eq!(
        statuses(&gates),
        vec![
            ("typecheck", GateStatus::Fail),
            ("build", GateStatus::Skip),
            ("accessibility", GateStatus::Skip),
            ("seo", GateStatus::Skip),
        ]
    );
    assert_eq!(gates[0].findings.len(), 1);
    assert_eq!(h.fakes.log.count("build"), 0);

    let report: VerifyReport = h.result(&job_id, Phase::Verify);
    assert_eq!(report.outcome, "degraded");
    let deployed: DeployResult = h.result(&job_id, Phase::Deploy);
    assert_eq!(deployed.verify_outcome, "degraded");
    assert_eq!(h.job(&job_id).phase, Phase::Done);

    let events = h.fakes.sink.events.lock().expect("events").clone();
    let gate_events = events.iter().filter(|e| e.kind == EVENT_GATE_RESULT).count();
    assert_eq!(gate_events, 4);
}

#[test]
fn strict_mode_fails_the_job_on_blocking_failure() {
    let mut config = test_config();
    config.verify.fail_job_on_blocking_failure = true;
    let h = Harness::new(config);
    h.fakes.checker.project_fails.store(true, Ordering::SeqCst);
    let job_id = h.submit();

    match h.orchestrator("w1").run_job(&job_id).expect("run") {
        RunOutcome::Stopped(StepOutcome::Failed { phase, reason }) => {
            assert_eq!(phase, Phase::Verify);
            assert!(reason.contains("typecheck"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.fakes.log.count("deploy"), 0);
    let job = h.job(&job_id);
    assert_eq!(job.phase, Phase::Failed);
    assert!(job.last_error.is_some());
}

#[test]
fn invalidating_verify_reruns_the_gates_for_a_new_attempt() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    let orchestrator = h.orchestrator("w1");
    let lease = HeldLease::acquire(orchestrator.lease_manager(), &job_id, orchestrator.worker_id())
        .expect("claim")
        .expect("claimed");
    for _ in 0..4 {
        assert!(matches!(
            orchestrator.step(&lease).expect("step"),
            StepOutcome::Advanced { .. }
        ));
    }
    lease.release().expect("release");
    assert_eq!(h.job(&job_id).phase, Phase::Deploy);
    assert_eq!(h.fakes.log.count("build"), 1);

    let rewound = h
        .api()
        .invalidate_job(&job_id, Phase::Verify)
        .expect("invalidate");
    assert_eq!(rewound.phase, Phase::Verify);
    assert_eq!(rewound.migration_attempt, 2);

    let outcome = orchestrator.run_job(&job_id).expect("rerun");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));

    // A new migration attempt never reuses the verdict of the previous one.
    assert_eq!(h.fakes.log.count("build"), 2);
    assert_eq!(h.fakes.log.count("generate_page"), 2);
    let gates = h
        .store
        .lock()
        .expect("store")
        .gate_results_latest(&job_id)
        .expect("gate results");
    assert!(gates.iter().all(|row| row.migration_attempt == 2));
    let report: VerifyReport = h.result(&job_id, Phase::Verify);
    assert_eq!(report.outcome, "pass");
}

#[test]
fn saturated_lane_times_out_the_build_gate() {
    let h = Harness::new(test_config());
    let now_ms = h.clock.now_ms();
    let foreign = h
        .store
        .lock()
        .expect("store")
        .verify_slot_try_acquire(VerifySlotRequest {
            lane: h.config.verify.lane.clone(),
            capacity: h.config.verify.lane_capacity,
            holder: "other-worker:build".to_string(),
            ttl_ms: 10 * 60 * 1_000,
            now_ms,
        })
        .expect("acquire slot");
    assert!(foreign.is_some());

    let job_id = h.submit();
    let outcome = h.orchestrator("w1").run_job(&job_id).expect("run");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));

    assert_eq!(h.fakes.log.count("build"), 0);
    let gates = h
        .store
        .lock()
        .expect("store")
        .gate_results_latest(&job_id)
        .expect("gate results");
    let build = gates
        .iter()
        .find(|row| row.gate_name == "build")
        .expect("build gate recorded");
    assert_eq!(build.status, GateStatus::Fail);
    assert!(build.findings[0].message.starts_with("timeout"));
    assert!(h.clock.now_ms() - now_ms >= 5_000);

    let report: VerifyReport = h.result(&job_id, Phase::Verify);
    assert_eq!(report.outcome, "degraded");
}

/// Sleeps through every build and remembers how many ran at once.
#[derive(Default)]
struct SlowBuilder {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ProjectBuilder for SlowBuilder {
    fn build(
        &self,
        _snapshot: &ProjectSnapshot,
        _deadline: Duration,
    ) -> Result<BuildReport, ServiceError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(400));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(BuildReport {
            success: true,
            findings: Vec::new(),
        })
    }
}

#[test]
fn build_lane_never_runs_more_builds_than_its_capacity() {
    let h = Harness::new(test_config());
    let jobs = [h.submit(), h.submit()];
    let scheduler = Arc::new(VerifyScheduler::new(
        h.store.clone(),
        Arc::new(SystemClock),
        LaneSettings {
            lane: "build".to_string(),
            capacity: 1,
            queue_wait: Duration::from_secs(5),
            poll: Duration::from_millis(10),
        },
    ));
    let builder = Arc::new(SlowBuilder::default());
    let snapshot = Arc::new(ProjectSnapshot::default());

    let handles: Vec<_> = jobs
        .iter()
        .enumerate()
        .map(|(i, job_id)| {
            let gate = BuildGate::new(
                scheduler.clone(),
                builder.clone(),
                job_id.clone(),
                1,
                format!("w{i}:build"),
            );
            let snapshot = snapshot.clone();
            std::thread::spawn(move || gate.run(&snapshot, Duration::from_millis(100)))
        })
        .collect();
    let verdicts: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("gate thread").expect("gate run"))
        .collect();

    assert_eq!(builder.peak.load(Ordering::SeqCst), 1);
    assert_eq!(builder.active.load(Ordering::SeqCst), 0);
    for verdict in &verdicts {
        assert!(!verdict.passed);
        assert!(verdict.findings[0].message.starts_with(TIMEOUT_FINDING_PREFIX));
    }
}

/// Looks up the stored gate results whenever a gate result is announced.
struct StoredResultsSink {
    store: SharedStore,
    job_id: JobId,
    seen: Mutex<Vec<usize>>,
}

impl ProgressSink for StoredResultsSink {
    fn publish(&self, event: &ProgressEvent) {
        if event.kind != EVENT_GATE_RESULT {
            return;
        }
        let stored = self
            .store
            .lock()
            .expect("store")
            .gate_results_latest(&self.job_id)
            .expect("gate results")
            .len();
        self.seen.lock().expect("seen").push(stored);
    }
}

#[test]
fn gate_results_are_announced_after_they_are_stored() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    let sink = Arc::new(StoredResultsSink {
        store: h.store.clone(),
        job_id: job_id.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(
        h.store.clone(),
        Services {
            progress: sink.clone(),
            ..h.fakes.services()
        },
        h.config.clone(),
        Arc::new(h.clock.clone()),
        WorkerId::try_new("w1").expect("worker id"),
    );

    let outcome = orchestrator.run_job(&job_id).expect("run");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));
    assert_eq!(*sink.seen.lock().expect("seen"), vec![4, 4, 4, 4]);
}
