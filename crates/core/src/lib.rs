#![forbid(unsafe_code)]

pub mod model;

pub mod ids {
    const JOB_ID_PREFIX: &str = "MIG-";
    const MIN_JOB_ID_DIGITS: usize = 4;
    const MAX_WORKER_ID_LEN: usize = 128;

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct JobId(String);

    impl JobId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, JobIdError> {
            let value = value.into();
            let trimmed = value.trim();
            validate_job_id(trimmed)?;
            Ok(Self(trimmed.to_string()))
        }

        pub fn from_seq(seq: i64) -> Self {
            Self(format!("{JOB_ID_PREFIX}{seq:04}"))
        }
    }

    impl std::fmt::Display for JobId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum JobIdError {
        Empty,
        MissingPrefix,
        TooFewDigits,
        InvalidDigit { ch: char },
    }

    impl JobIdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "job id must not be empty",
                Self::MissingPrefix => "job id must start with MIG-",
                Self::TooFewDigits => "job id must have at least 4 digits",
                Self::InvalidDigit { .. } => "job id digits must be [0-9]",
            }
        }
    }

    fn validate_job_id(value: &str) -> Result<(), JobIdError> {
        if value.is_empty() {
            return Err(JobIdError::Empty);
        }
        let Some(digits) = value.strip_prefix(JOB_ID_PREFIX) else {
            return Err(JobIdError::MissingPrefix);
        };
        if digits.len() < MIN_JOB_ID_DIGITS {
            return Err(JobIdError::TooFewDigits);
        }
        if let Some(ch) = digits.chars().find(|c| !c.is_ascii_digit()) {
            return Err(JobIdError::InvalidDigit { ch });
        }
        Ok(())
    }

    /// Identity of a worker process (or thread) competing for job leases.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct WorkerId(String);

    impl WorkerId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, WorkerIdError> {
            let value = value.into();
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(WorkerIdError::Empty);
            }
            if trimmed.len() > MAX_WORKER_ID_LEN {
                return Err(WorkerIdError::TooLong);
            }
            if trimmed.chars().any(|c| c.is_control()) {
                return Err(WorkerIdError::ContainsControl);
            }
            Ok(Self(trimmed.to_string()))
        }
    }

    impl std::fmt::Display for WorkerId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum WorkerIdError {
        Empty,
        TooLong,
        ContainsControl,
    }

    impl WorkerIdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "worker id must not be empty",
                Self::TooLong => "worker id is too long",
                Self::ContainsControl => "worker id contains control characters",
            }
        }
    }

}
