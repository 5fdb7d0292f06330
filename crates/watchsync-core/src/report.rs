use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Export,
    Import,
}

/// Where a run is, or where it ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Init,
    Indexing,
    Extracting,
    Applying,
    Merging,
    Done,
    PartialFailure,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::PartialFailure | RunPhase::Aborted)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Indexing => "indexing",
            RunPhase::Extracting => "extracting",
            RunPhase::Applying => "applying",
            RunPhase::Merging => "merging",
            RunPhase::Done => "done",
            RunPhase::PartialFailure => "partial failure",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UserNotFound,
    SectionUnavailable,
    ExtractFailure,
    ApplyFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::UserNotFound => "user not found",
            FailureKind::SectionUnavailable => "section unavailable",
            FailureKind::ExtractFailure => "extract failure",
            FailureKind::ApplyFailure => "apply failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MatchAmbiguous,
    UserSkipped,
    SelectorUnmatched,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub message: String,
}

/// Counters and problems of one run, or of one user's share of it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub phase: RunPhase,
    pub dry_run: bool,
    pub users_processed: usize,
    pub users_skipped: usize,
    pub items_matched: usize,
    pub items_unmatched: usize,
    pub states_applied: usize,
    pub states_unchanged: usize,
    pub states_failed: usize,
    pub ambiguous_matches: usize,
    pub sections_failed: usize,
    pub records_exported: usize,
    pub records_skipped: usize,
    pub cancelled: bool,
    pub failures: Vec<Failure>,
    pub warnings: Vec<Warning>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((duration.as_secs_f64() * 100.0).round() / 100.0)
}

impl RunReport {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn fail(&mut self, kind: FailureKind, user: Option<&str>, item: Option<&str>, message: impl Into<String>) {
        self.failures.push(Failure {
            kind,
            user: user.map(str::to_string),
            item: item.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn warn(&mut self, kind: WarningKind, user: Option<&str>, item: Option<&str>, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            user: user.map(str::to_string),
            item: item.map(str::to_string),
            message: message.into(),
        });
    }

    /// Fold a partial report into this one.
    pub fn absorb(&mut self, other: RunReport) {
        self.users_processed += other.users_processed;
        self.users_skipped += other.users_skipped;
        self.items_matched += other.items_matched;
        self.items_unmatched += other.items_unmatched;
        self.states_applied += other.states_applied;
        self.states_unchanged += other.states_unchanged;
        self.states_failed += other.states_failed;
        self.ambiguous_matches += other.ambiguous_matches;
        self.sections_failed += other.sections_failed;
        self.records_exported += other.records_exported;
        self.records_skipped += other.records_skipped;
        self.cancelled |= other.cancelled;
        self.failures.extend(other.failures);
        self.warnings.extend(other.warnings);
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.sections_failed > 0 || self.states_failed > 0
    }

    /// Settle the terminal phase from what was recorded.
    pub fn finish(&mut self, duration: Duration) {
        self.duration = duration;
        if self.phase != RunPhase::Aborted {
            self.phase = if self.has_failures() || self.cancelled {
                RunPhase::PartialFailure
            } else {
                RunPhase::Done
            };
        }
    }

    /// Process exit status. Per-record, per-section and per-user failures are
    /// reported, not fatal, so only an aborted run is non-zero.
    pub fn exit_code(&self) -> i32 {
        match self.phase {
            RunPhase::Aborted => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_and_finish() {
        let mut total = RunReport::new(RunMode::Import);
        let mut user = RunReport::default();
        user.users_processed = 1;
        user.states_applied = 3;
        user.warn(WarningKind::MatchAmbiguous, Some("alice"), Some("Bar"), "2 candidates");
        total.absorb(user);

        total.finish(Duration::from_secs(1));
        assert_eq!(total.phase, RunPhase::Done);
        assert_eq!(total.states_applied, 3);
        assert_eq!(total.warnings.len(), 1);
        assert_eq!(total.exit_code(), 0);
    }

    #[test]
    fn test_failures_make_partial_failure() {
        let mut report = RunReport::new(RunMode::Import);
        report.fail(FailureKind::UserNotFound, Some("carol"), None, "not on destination");
        report.finish(Duration::ZERO);
        assert_eq!(report.phase, RunPhase::PartialFailure);
        assert_eq!(report.failures_of(FailureKind::UserNotFound), 1);
        assert_eq!(report.exit_code(), 0);

        report.phase = RunPhase::Aborted;
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_report_serializes_duration_as_seconds() {
        let mut report = RunReport::new(RunMode::Export);
        report.finish(Duration::from_millis(1500));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], 1.5);
        assert_eq!(json["phase"], "done");
        assert_eq!(json["mode"], "export");
    }
}
