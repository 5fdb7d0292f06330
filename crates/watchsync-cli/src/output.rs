use clap::ValueEnum;
use comfy_table::{presets, Attribute, Cell, Color, Table};
use owo_colors::OwoColorize;
use serde_json::json;
use watchsync_core::{RunPhase, RunReport};

/// Failures listed in human output before the rest are summarized.
const MAX_LISTED_FAILURES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    #[value(name = "json-pretty")]
    JsonPretty,
}

pub struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self { format, quiet }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_human(&self) -> bool {
        self.format == OutputFormat::Human
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => println!("{} {}", "✓".green(), msg.as_ref()),
            _ => self.print_json(&json!({ "type": "success", "message": msg.as_ref() })),
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        // Errors are shown even in quiet mode
        match self.format {
            OutputFormat::Human => eprintln!("{} {}", "✗".red(), msg.as_ref()),
            _ => self.print_json(&json!({ "type": "error", "message": msg.as_ref() })),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => println!("{}", msg.as_ref()),
            _ => self.print_json(&json!({ "type": "info", "message": msg.as_ref() })),
        }
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => println!("{} {}", "⚠".yellow(), msg.as_ref()),
            _ => self.print_json(&json!({ "type": "warning", "message": msg.as_ref() })),
        }
    }

    pub fn json(&self, data: &serde_json::Value) {
        if self.quiet && !self.is_human() {
            return;
        }
        self.print_json(data);
    }

    pub fn table(&self, table: &Table) {
        if !self.quiet {
            println!("{}", table);
        }
    }

    fn print_json(&self, data: &serde_json::Value) {
        match self.format {
            OutputFormat::JsonPretty => println!("{}", serde_json::to_string_pretty(data).unwrap_or_default()),
            _ => println!("{}", serde_json::to_string(data).unwrap_or_default()),
        }
    }

    /// Final summary of a run: a table for people, the report itself for machines.
    pub fn report(&self, report: &RunReport) {
        if !self.is_human() {
            let value = serde_json::to_value(report).unwrap_or_else(|e| json!({ "error": e.to_string() }));
            self.json(&json!({ "type": "report", "report": value }));
            return;
        }
        if self.quiet && report.phase == RunPhase::Done {
            return;
        }

        let mut table = new_table();
        table.set_header(vec![
            Cell::new(format!("{:?} run", report.mode)).add_attribute(Attribute::Bold),
            Cell::new(phase_cell_text(report)).fg(phase_color(report.phase)),
        ]);
        let mut row = |label: &str, value: usize| {
            if value > 0 {
                table.add_row(vec![Cell::new(label), Cell::new(value)]);
            }
        };
        row("Users processed", report.users_processed);
        row("Users skipped", report.users_skipped);
        row("Records exported", report.records_exported);
        row("Records skipped", report.records_skipped);
        row("Items matched", report.items_matched);
        row("Items unmatched", report.items_unmatched);
        row("Ambiguous matches", report.ambiguous_matches);
        row("States applied", report.states_applied);
        row("States unchanged", report.states_unchanged);
        row("States failed", report.states_failed);
        row("Sections failed", report.sections_failed);
        table.add_row(vec![
            Cell::new("Duration"),
            Cell::new(format!("{:.1}s", report.duration.as_secs_f64())),
        ]);
        println!("{}", table);

        if !report.failures.is_empty() {
            let mut failures = new_table();
            failures.set_header(vec!["Problem", "User", "Item", "Detail"]);
            for failure in report.failures.iter().take(MAX_LISTED_FAILURES) {
                failures.add_row(vec![
                    Cell::new(failure.kind.to_string()).fg(Color::Red),
                    Cell::new(failure.user.as_deref().unwrap_or("-")),
                    Cell::new(failure.item.as_deref().unwrap_or("-")),
                    Cell::new(&failure.message),
                ]);
            }
            println!("{}", failures);
            if report.failures.len() > MAX_LISTED_FAILURES {
                println!(
                    "  ... and {} more (use --output json for the full list)",
                    report.failures.len() - MAX_LISTED_FAILURES
                );
            }
        }
        if report.dry_run && !self.quiet {
            println!("{}", "Dry run: nothing was changed on the destination.".yellow());
        }
    }
}

pub fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL);
    table.apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

fn phase_cell_text(report: &RunReport) -> String {
    if report.cancelled {
        format!("{} (cancelled)", report.phase)
    } else {
        report.phase.to_string()
    }
}

fn phase_color(phase: RunPhase) -> Color {
    match phase {
        RunPhase::Done => Color::Green,
        RunPhase::PartialFailure => Color::Yellow,
        RunPhase::Aborted => Color::Red,
        _ => Color::Reset,
    }
}
