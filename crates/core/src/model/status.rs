#![forbid(unsafe_code)]

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                let lowered = raw.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Lifecycle of one generated file.
    UnitStatus {
        Pending => "pending",
        Writing => "writing",
        Repairing => "repairing",
        Done => "done",
        Fallback => "fallback",
    }
}

impl UnitStatus {
    /// A settled unit never receives another AI attempt within the same job.
    pub fn is_settled(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Fallback)
    }
}

string_enum! {
    UnitKind {
        Shared => "shared",
        Page => "page",
        Scaffold => "scaffold",
    }
}

string_enum! {
    GateStatus {
        Pass => "pass",
        Fail => "fail",
        Skip => "skip",
    }
}

string_enum! {
    Severity {
        Error => "error",
        Warning => "warning",
        Info => "info",
    }
}

string_enum! {
    AssetStatus {
        Downloaded => "downloaded",
        Optimized => "optimized",
        Skipped => "skipped",
        Failed => "failed",
    }
}

impl AssetStatus {
    /// Statuses whose `bytes_final` count against the aggregate cap.
    pub fn is_stored(self) -> bool {
        matches!(self, AssetStatus::Downloaded | AssetStatus::Optimized)
    }
}

string_enum! {
    /// Overall result of the verification phase.
    VerifyOutcome {
        Pass => "pass",
        Degraded => "degraded",
    }
}
