//! Human-readable run summary, mailed to the operator and logged

use crate::run_state::{RunState, RunStatus, SlotResult};
use crate::utils::{binary_tb, format_duration, format_folder_size, format_time, throughput_mb_s};
use chrono::{DateTime, Local};

pub struct RunReport<'a> {
    pub status: RunStatus,
    /// Subject prefix, `TRY-MODE - ` for dry runs
    pub mode: &'a str,
    pub run_start: DateTime<Local>,
    pub run_end: DateTime<Local>,
    pub results: &'a [SlotResult],
    pub errors: &'a [String],
    pub unallocated: &'a [String],
}

impl<'a> RunReport<'a> {
    pub fn from_state(
        state: &'a RunState,
        mode: &'a str,
        run_start: DateTime<Local>,
        run_end: DateTime<Local>,
    ) -> Self {
        Self {
            status: state.status(),
            mode,
            run_start,
            run_end,
            results: state.results(),
            errors: state.errors(),
            unallocated: state.unallocated(),
        }
    }

    /// Mail subject suffix: `<mode><STATUS>`
    pub fn subject(&self) -> String {
        format!("{}{}", self.mode, self.status)
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Backup job status: {}{}", self.mode, self.status),
            String::new(),
            format!("Backup start time: {}", format_time(&self.run_start)),
            format!("Backup finish time: {}", format_time(&self.run_end)),
            String::new(),
            "Change the listed tapes and mark them with the folder-lists!!".to_string(),
            String::new(),
        ];

        if !self.errors.is_empty() {
            lines.push("Got the following error messages while processing:".to_string());
            lines.extend(self.errors.iter().cloned());
        }

        for result in self.results {
            render_slot(&mut lines, result);
        }

        if !self.unallocated.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "ERROR: Unprocessed folders (did not fit on the available tapes): {}",
                self.unallocated
                    .iter()
                    .map(|name| format!("'{}'", name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

fn render_slot(lines: &mut Vec<String>, result: &SlotResult) {
    lines.push(String::new());
    lines.push(format!(
        "Backup status for tape in slot '{}' with label '{}':",
        result.slot_id, result.label
    ));
    lines.push(String::new());
    lines.push(format!("Start time: {}", format_time(&result.start_time)));
    lines.push(format!("Stop time: {}", format_time(&result.stop_time)));
    lines.push(format!(
        "Duration: {}",
        format_duration(result.duration_secs() as f64)
    ));
    lines.push(format!("Exit code: {}", result.exit_code));

    for folder in &result.folders {
        lines.push(format!(
            "Folder '{}' size: {}",
            folder.name,
            format_folder_size(folder.size_mb)
        ));
    }

    let size_mb = result.size_mb();
    lines.push(String::new());
    lines.push(format!("Full size: {:.3} TB", binary_tb(size_mb)));
    lines.push(format!(
        "Calculated throughput: {:.2} MB/s",
        throughput_mb_s(size_mb, result.duration_secs())
    ));
    lines.push(String::new());
}
