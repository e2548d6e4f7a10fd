#![forbid(unsafe_code)]

mod support;
use support::*;

use sm_core::model::{AssetStatus, Phase};
use sm_pipeline::assets::{
    AssetSummary, REASON_AGGREGATE_CAP, REASON_BLOCKLISTED, REASON_FETCH_ERROR, REASON_FILE_CAP,
    REASON_INVALID_URL, REASON_OFF_ORIGIN,
};
use sm_pipeline::orchestrator::{RunOutcome, StepOutcome};
use sm_pipeline::phases::{TransformResult, asset_dir};
use sm_storage::AssetRecordRow;

fn serve(h: &Harness, url: &str, len: usize) {
    h.fakes
        .fetcher
        .bodies
        .lock()
        .expect("bodies")
        .insert(url.to_string(), vec![0u8; len]);
}

fn reference(h: &Harness, urls: &[&str]) {
    let mut assets = h.fakes.analyzer.assets.lock().expect("assets");
    assets.extend(urls.iter().map(|u| u.to_string()));
}

fn decision<'a>(rows: &'a [AssetRecordRow], url: &str) -> &'a AssetRecordRow {
    rows.iter()
        .find(|row| row.source_url == url)
        .unwrap_or_else(|| panic!("no decision for {url}"))
}

fn fetched(h: &Harness) -> Vec<String> {
    h.fakes.fetcher.fetched.lock().expect("fetched").clone()
}

#[test]
fn blocklisted_host_is_never_fetched() {
    let h = Harness::new(test_config());
    let getty = "https://images.gettyimages.com/photos/hero.jpg";
    let logo = "https://shop.example/logo.png";
    serve(&h, logo, 32);
    reference(&h, &[getty, logo]);
    let job_id = h.submit();

    let outcome = h.orchestrator("w1").run_job(&job_id).expect("run");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));

    let rows = h
        .store
        .lock()
        .expect("store")
        .asset_records_latest(&job_id)
        .expect("asset records");
    let blocked = decision(&rows, getty);
    assert_eq!(blocked.status, AssetStatus::Skipped);
    assert_eq!(blocked.skip_reason.as_deref(), Some(REASON_BLOCKLISTED));
    assert!(blocked.local_path.is_none());
    assert!(!fetched(&h).iter().any(|u| u.contains("gettyimages")));

    let stored = decision(&rows, logo);
    assert_eq!(stored.status, AssetStatus::Downloaded);
    let local_path = stored.local_path.as_deref().expect("local path");
    assert!(local_path.starts_with("public/assets/"), "{local_path}");
    assert!(local_path.ends_with("-logo.png"), "{local_path}");
}

#[test]
fn every_candidate_gets_one_decision_within_the_caps() {
    let mut config = test_config();
    config.assets.max_file_bytes = 60;
    config.assets.max_total_bytes = 100;
    let h = Harness::new(config);

    let too_big = "https://shop.example/img/e.png";
    let a = "https://shop.example/img/a.png";
    let font = "https://fonts.gstatic.com/s/inter.woff2";
    let off_origin = "https://cdn.elsewhere.example/banner.png";
    let ftp = "ftp://shop.example/file.bin";
    let missing = "https://shop.example/img/missing.png";
    let b = "https://shop.example/img/b.png";
    let c = "https://shop.example/img/c.png";
    let d = "https://shop.example/img/d.png";
    for (url, len) in [(too_big, 70), (a, 50), (font, 5), (off_origin, 10), (b, 40), (c, 30), (d, 5)] {
        serve(&h, url, len);
    }
    reference(&h, &[too_big, a, font, off_origin, ftp, a, missing, b, c, d]);
    let job_id = h.submit();

    let outcome = h.orchestrator("w1").run_job(&job_id).expect("run");
    assert_eq!(outcome, RunOutcome::Stopped(StepOutcome::Completed));

    let rows = h
        .store
        .lock()
        .expect("store")
        .asset_records_latest(&job_id)
        .expect("asset records");
    assert_eq!(rows.len(), 9);

    let expect = |url: &str, status: AssetStatus, reason: Option<&str>| {
        let row = decision(&rows, url);
        assert_eq!(row.status, status, "{url}");
        assert_eq!(row.skip_reason.as_deref(), reason, "{url}");
    };
    expect(too_big, AssetStatus::Skipped, Some(REASON_FILE_CAP));
    expect(a, AssetStatus::Downloaded, None);
    expect(font, AssetStatus::Downloaded, None);
    expect(off_origin, AssetStatus::Skipped, Some(REASON_OFF_ORIGIN));
    expect(ftp, AssetStatus::Failed, Some(REASON_INVALID_URL));
    expect(missing, AssetStatus::Failed, Some(REASON_FETCH_ERROR));
    expect(b, AssetStatus::Downloaded, None);
    expect(c, AssetStatus::Skipped, Some(REASON_AGGREGATE_CAP));
    expect(d, AssetStatus::Skipped, Some(REASON_AGGREGATE_CAP));

    let stored_bytes: u64 = rows
        .iter()
        .filter(|row| row.status.is_stored())
        .map(|row| row.bytes_final)
        .sum();
    assert_eq!(stored_bytes, 95);

    let fetched = fetched(&h);
    assert_eq!(fetched.iter().filter(|u| *u == a).count(), 1);
    assert!(!fetched.iter().any(|u| u == off_origin || u == d));

    let transform: TransformResult = h.result(&job_id, Phase::Transform);
    assert_eq!(
        transform.assets,
        AssetSummary {
            stored: 3,
            skipped: 4,
            failed: 2,
            bytes_total: 95,
        }
    );

    let dir = asset_dir(h.store.lock().expect("store").storage_dir(), &job_id);
    let files = std::fs::read_dir(&dir).expect("asset dir").count();
    assert_eq!(files, 3);
}

#[test]
fn relative_references_resolve_against_the_origin() {
    let h = Harness::new(test_config());
    serve(&h, "https://shop.example/img/logo.svg", 12);
    reference(&h, &["/img/logo.svg"]);
    let job_id = h.submit();

    h.orchestrator("w1").run_job(&job_id).expect("run");

    let rows = h
        .store
        .lock()
        .expect("store")
        .asset_records_latest(&job_id)
        .expect("asset records");
    let row = decision(&rows, "/img/logo.svg");
    assert_eq!(row.status, AssetStatus::Downloaded);
    assert_eq!(row.bytes_final, 12);
    assert_eq!(fetched(&h), vec!["https://shop.example/img/logo.svg".to_string()]);
}
