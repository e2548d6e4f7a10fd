#![forbid(unsafe_code)]

//! Input signatures. Every field is length-prefixed so that adjacent fields can never be
//! re-split into a colliding sequence.

use sha2::Digest as _;
use sm_core::ids::JobId;
use sm_core::model::Phase;
use std::fmt::Write as _;

#[derive(Clone)]
pub struct SignatureBuilder {
    hasher: sha2::Sha256,
}

impl SignatureBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: sha2::Sha256::new(),
        };
        builder.push(domain.as_bytes());
        builder
    }

    pub fn field(mut self, value: &str) -> Self {
        self.push(value.as_bytes());
        self
    }

    pub fn opt_field(self, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.field("1").field(value),
            None => self.field("0"),
        }
    }

    pub fn int_field(self, value: i64) -> Self {
        self.field(&value.to_string())
    }

    pub fn finish(self) -> String {
        let digest = self.hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest {
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }

    fn push(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }
}

/// What the first phase depends on: the source site and the request around it.
pub struct SourceDescriptor<'a> {
    pub source_url: &'a str,
    pub project_id: Option<&'a str>,
    pub instructions: Option<&'a str>,
}

pub fn analyze_signature(source: &SourceDescriptor<'_>) -> String {
    SignatureBuilder::new("phase")
        .field(Phase::Analyze.as_str())
        .field(source.source_url)
        .opt_field(source.project_id)
        .opt_field(source.instructions)
        .finish()
}

/// `sha256(phase, sig(prev), result(prev), phase config)`.
pub fn chained_signature(
    phase: Phase,
    previous_signature: &str,
    previous_result_json: &str,
    phase_config: &str,
) -> String {
    SignatureBuilder::new("phase")
        .field(phase.as_str())
        .field(previous_signature)
        .field(previous_result_json)
        .field(phase_config)
        .finish()
}

/// Key collapsing duplicate verification requests of one migration attempt.
pub fn verify_request_key(job_id: &JobId, migration_attempt: i64, gate_name: &str) -> String {
    SignatureBuilder::new("verify")
        .field(job_id.as_str())
        .int_field(migration_attempt)
        .field(gate_name)
        .finish()
}
