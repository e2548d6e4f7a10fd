#![forbid(unsafe_code)]

mod support;
use support::*;

use sm_core::ids::JobId;
use sm_core::model::Phase;
use sm_pipeline::PipelineError;
use sm_pipeline::api::SubmitRequest;
use sm_pipeline::lease::HeldLease;
use sm_pipeline::progress::{
    EVENT_CANCEL_REQUESTED, EVENT_JOB_CANCELLED, EVENT_JOB_INVALIDATED, EVENT_JOB_SUBMITTED,
};
use sm_storage::StoreError;
use std::sync::Arc;

#[test]
fn submit_validates_and_normalizes() {
    let h = Harness::new(test_config());
    let api = h.api();

    let err = api
        .submit_job(SubmitRequest {
            source_url: "ftp://shop.example/".to_string(),
            ..Default::default()
        })
        .expect_err("ftp rejected");
    assert!(matches!(err, PipelineError::InvalidInput(_)), "{err}");

    let job = api
        .submit_job(SubmitRequest {
            source_url: "  https://shop.example  ".to_string(),
            project_id: Some("  ".to_string()),
            user_id: Some(" user-7 ".to_string()),
            instructions: None,
        })
        .expect("submit");
    assert_eq!(job.phase, Phase::Analyze);
    assert_eq!(job.source_url, "https://shop.example/");
    assert_eq!(job.project_id, None);
    assert_eq!(job.user_id.as_deref(), Some("user-7"));
    assert_eq!(job.migration_attempt, 1);
    assert!(job.id.as_str().starts_with("MIG-"));

    let next = h.submit();
    assert_ne!(next, job.id);
}

#[test]
fn status_reports_progress_and_pages_events() {
    let h = Harness::new(test_config());
    let sink = Arc::new(RecordingSink::default());
    let api = h.api().with_progress(sink.clone());
    let job = api
        .submit_job(SubmitRequest {
            source_url: SOURCE_URL.to_string(),
            ..Default::default()
        })
        .expect("submit");
    assert_eq!(sink.events.lock().expect("events")[0].kind, EVENT_JOB_SUBMITTED);

    h.orchestrator("w1").run_job(&job.id).expect("run");

    let status = api.get_job_status(&job.id, 0).expect("status");
    assert_eq!(status.job.phase, Phase::Done);
    assert_eq!(status.phase_attempts.len(), Phase::WORK.len());
    assert!(status.manifest.iter().any(|u| u.path == "src/pages/about.tsx"));
    assert_eq!(status.gate_results.len(), 4);
    assert!(status.assets.is_empty());
    assert_eq!(status.events[0].kind, EVENT_JOB_SUBMITTED);
    assert!(status.events.windows(2).all(|w| w[0].seq < w[1].seq));

    let last_seq = status.events.last().expect("events").seq;
    let tail = api.get_job_status(&job.id, last_seq - 1).expect("status");
    assert_eq!(tail.events.len(), 1);
    assert_eq!(tail.events[0].seq, last_seq);

    let unknown = JobId::from_seq(999);
    assert!(matches!(
        api.get_job_status(&unknown, 0),
        Err(PipelineError::UnknownJob(_))
    ));
}

#[test]
fn cancelling_an_unheld_job_is_immediate() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    let api = h.api();

    let cancelled = api.cancel_job(&job_id).expect("cancel");
    assert_eq!(cancelled.phase, Phase::Cancelled);
    assert!(cancelled.completed_at_ms.is_some());

    // Terminal jobs come back unchanged.
    let again = api.cancel_job(&job_id).expect("cancel again");
    assert_eq!(again.phase, Phase::Cancelled);
    assert_eq!(again.revision, cancelled.revision);

    let status = api.get_job_status(&job_id, 0).expect("status");
    let kinds: Vec<&str> = status.events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec![EVENT_JOB_SUBMITTED, EVENT_JOB_CANCELLED]);

    assert_eq!(
        h.orchestrator("w1").run_job(&job_id).expect("run"),
        sm_pipeline::orchestrator::RunOutcome::NotClaimed
    );
}

#[test]
fn cancelling_a_held_job_flags_it() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    let orchestrator = h.orchestrator("w1");
    let _lease = HeldLease::acquire(orchestrator.lease_manager(), &job_id, orchestrator.worker_id())
        .expect("claim")
        .expect("claimed");

    let api = h.api();
    let flagged = api.cancel_job(&job_id).expect("cancel");
    assert_eq!(flagged.phase, Phase::Analyze);
    assert!(flagged.cancel_requested);
    assert_eq!(flagged.lease_owner.as_deref(), Some("w1"));

    // A repeated request does not log a second event.
    api.cancel_job(&job_id).expect("cancel again");
    let status = api.get_job_status(&job_id, 0).expect("status");
    let requested = status
        .events
        .iter()
        .filter(|e| e.kind == EVENT_CANCEL_REQUESTED)
        .count();
    assert_eq!(requested, 1);
}

#[test]
fn completed_jobs_are_left_alone_by_cancel() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    h.orchestrator("w1").run_job(&job_id).expect("run");

    let job = h.api().cancel_job(&job_id).expect("cancel");
    assert_eq!(job.phase, Phase::Done);
    assert!(!job.cancel_requested);
}

#[test]
fn invalidation_rules() {
    let h = Harness::new(test_config());
    let job_id = h.submit();
    let orchestrator = h.orchestrator("w1");
    let api = h.api();

    let lease = HeldLease::acquire(orchestrator.lease_manager(), &job_id, orchestrator.worker_id())
        .expect("claim")
        .expect("claimed");
    orchestrator.step(&lease).expect("analyze");
    orchestrator.step(&lease).expect("plan");
    assert_eq!(h.job(&job_id).phase, Phase::Transform);

    match api.invalidate_job(&job_id, Phase::Analyze) {
        Err(PipelineError::Store(StoreError::LeaseHeld { holder, .. })) => {
            assert_eq!(holder, "w1");
        }
        other => panic!("expected LeaseHeld, got {other:?}"),
    }
    lease.release().expect("release");

    assert!(matches!(
        api.invalidate_job(&job_id, Phase::Deploy),
        Err(PipelineError::Store(StoreError::InvalidInput(_)))
    ));

    let rewound = api.invalidate_job(&job_id, Phase::Plan).expect("invalidate");
    assert_eq!(rewound.phase, Phase::Plan);
    assert_eq!(rewound.migration_attempt, 2);
    let status = api.get_job_status(&job_id, 0).expect("status");
    assert!(!status.phase_attempts.contains_key(&Phase::Plan));
    assert_eq!(status.phase_attempts.get(&Phase::Analyze), Some(&1));
    assert!(status.events.iter().any(|e| e.kind == EVENT_JOB_INVALIDATED));

    orchestrator.run_job(&job_id).expect("rerun");
    assert_eq!(h.fakes.log.count("analyze"), 1);
    assert_eq!(h.fakes.log.count("plan"), 2);

    assert!(matches!(
        api.invalidate_job(&job_id, Phase::Verify),
        Err(PipelineError::Store(StoreError::JobTerminal { .. }))
    ));
}
