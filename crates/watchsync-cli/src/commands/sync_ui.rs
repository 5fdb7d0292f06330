use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use watchsync_core::{RunObserver, RunPhase, RunReport};

/// Progress bars for a run: one for users, one for records.
///
/// Without a terminal the bars stay hidden and per-user results are logged instead.
pub struct SyncUI {
    _multi: MultiProgress,
    users: ProgressBar,
    records: ProgressBar,
    interactive: bool,
}

impl SyncUI {
    pub fn new(enabled: bool) -> Self {
        let interactive = enabled && is_interactive();
        let multi = MultiProgress::new();
        if !interactive {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }

        let users = multi.add(ProgressBar::new(0));
        users.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] users   {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        let records = multi.add(ProgressBar::new(0));
        records.set_style(
            ProgressStyle::with_template("  [{wide_bar:.cyan/blue}] {pos}/{len} records ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );

        if !interactive {
            tracing::debug!(
                operation = "ui_init",
                mode = "non_interactive",
                "Progress bars disabled, using structured logging"
            );
        }

        Self {
            _multi: multi,
            users,
            records,
            interactive,
        }
    }
}

impl RunObserver for SyncUI {
    fn phase_changed(&self, phase: RunPhase) {
        if phase.is_terminal() {
            self.records.finish_and_clear();
            self.users.finish_and_clear();
        } else {
            self.users.set_message(phase.to_string());
        }
    }

    fn users_planned(&self, count: usize) {
        self.users.set_length(count as u64);
    }

    fn user_started(&self, user: &str, records: usize) {
        self.records.inc_length(records as u64);
        self.users.set_message(user.to_string());
    }

    fn record_done(&self, _user: &str) {
        self.records.inc(1);
    }

    fn user_finished(&self, user: &str, report: &RunReport) {
        self.users.inc(1);
        if !self.interactive {
            tracing::info!(
                operation = "user_done",
                user = user,
                applied = report.states_applied,
                unchanged = report.states_unchanged,
                failures = report.failures.len(),
                exported = report.records_exported,
                "Finished '{}'",
                user
            );
        }
    }
}

pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}
