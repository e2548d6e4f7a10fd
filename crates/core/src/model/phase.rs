#![forbid(unsafe_code)]

/// Ordered stage of a migration job.
///
/// Work phases run strictly in declaration order; `Done`, `Failed` and `Cancelled` are
/// terminal and never change once reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Analyze,
    Plan,
    Transform,
    Verify,
    Deploy,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub const WORK: [Phase; 5] = [
        Phase::Analyze,
        Phase::Plan,
        Phase::Transform,
        Phase::Verify,
        Phase::Deploy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analyze => "ANALYZE",
            Phase::Plan => "PLAN",
            Phase::Transform => "TRANSFORM",
            Phase::Verify => "VERIFY",
            Phase::Deploy => "DEPLOY",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
            Phase::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        let phase = match upper.as_str() {
            "ANALYZE" => Phase::Analyze,
            "PLAN" => Phase::Plan,
            "TRANSFORM" => Phase::Transform,
            "VERIFY" => Phase::Verify,
            "DEPLOY" => Phase::Deploy,
            "DONE" => Phase::Done,
            "FAILED" => Phase::Failed,
            "CANCELLED" | "CANCELED" => Phase::Cancelled,
            _ => return None,
        };
        Some(phase)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }

    pub fn is_work(self) -> bool {
        !self.is_terminal()
    }

    /// Phase that follows a successful run of `self`. Terminal phases map to themselves.
    pub fn next(self) -> Phase {
        match self {
            Phase::Analyze => Phase::Plan,
            Phase::Plan => Phase::Transform,
            Phase::Transform => Phase::Verify,
            Phase::Verify => Phase::Deploy,
            Phase::Deploy => Phase::Done,
            terminal => terminal,
        }
    }

    /// Work phase that precedes `self`, if any.
    pub fn previous(self) -> Option<Phase> {
        match self {
            Phase::Plan => Some(Phase::Analyze),
            Phase::Transform => Some(Phase::Plan),
            Phase::Verify => Some(Phase::Transform),
            Phase::Deploy => Some(Phase::Verify),
            _ => None,
        }
    }

    /// Position in the pipeline order; terminal phases sort after every work phase.
    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Analyze => 0,
            Phase::Plan => 1,
            Phase::Transform => 2,
            Phase::Verify => 3,
            Phase::Deploy => 4,
            Phase::Done | Phase::Failed | Phase::Cancelled => 5,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
