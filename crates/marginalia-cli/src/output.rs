//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use marginalia_core::{
    AnnotationPayload, AnnotationRecord, DocumentKey, Loaded, QueueEntry, TerminalFailure,
};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode JSON output: {}", e),
        }
    }

    /// Print a local annotation record
    pub fn print_record(&self, record: &AnnotationRecord) {
        match self.format {
            OutputFormat::Human => {
                println!("Document:    {}", record.document_key);
                println!("Sync state:  {}", record.sync_state);
                println!("Contents:    {}", payload_summary(&record.payload));
                println!("Created:     {}", format_time(&record.created_at));
                println!("Updated:     {}", format_time(&record.local_updated_at));
                match record.remote_updated_at {
                    Some(ref remote) => println!("Remote:      {}", format_time(remote)),
                    None => println!("Remote:      (never pushed)"),
                }
            }
            OutputFormat::Json => self.json(record),
            OutputFormat::Quiet => println!("{}", record.sync_state),
        }
    }

    /// Print the answer to a load
    pub fn print_loaded(&self, key: &DocumentKey, loaded: Option<&Loaded>) {
        match (self.format, loaded) {
            (OutputFormat::Human, Some(loaded)) => {
                println!("Document:    {}", key);
                println!("Source:      {}", source_label(loaded));
                println!("Contents:    {}", payload_summary(&loaded.payload));
                println!("Updated:     {}", format_time(&loaded.updated_at));
            }
            (OutputFormat::Human, None) => println!("No annotations for {}.", key),
            (OutputFormat::Json, Some(loaded)) => self.json(loaded),
            (OutputFormat::Json, None) => println!("null"),
            (OutputFormat::Quiet, Some(loaded)) => println!("{}", source_label(loaded)),
            (OutputFormat::Quiet, None) => {}
        }
    }

    /// Print the sync queue in drain order
    pub fn print_queue(&self, entries: &[QueueEntry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("Nothing waiting to sync.");
                    return;
                }
                for (i, entry) in entries.iter().enumerate() {
                    println!(
                        "{:>3}. {} | {} | queued {} | attempts {}",
                        i + 1,
                        truncate(entry.document_key.as_str(), 50),
                        payload_summary(&entry.payload),
                        format_time(&entry.enqueued_at),
                        entry.attempt_count
                    );
                }
                println!("\n{} pending", entries.len());
            }
            OutputFormat::Json => self.json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.document_key);
                }
            }
        }
    }

    /// Print documents whose saves were abandoned
    pub fn print_failures(&self, failures: &[TerminalFailure]) {
        match self.format {
            OutputFormat::Human => {
                if failures.is_empty() {
                    println!("No failed documents.");
                    return;
                }
                for failure in failures {
                    println!(
                        "{} | {} attempts | {} | {}",
                        truncate(failure.document_key.as_str(), 50),
                        failure.attempts,
                        format_time(&failure.failed_at),
                        failure.reason
                    );
                }
                println!("\n{} document(s) not synchronized", failures.len());
            }
            OutputFormat::Json => self.json(failures),
            OutputFormat::Quiet => {
                for failure in failures {
                    println!("{}", failure.document_key);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning (stderr, so JSON on stdout stays parseable)
    pub fn warning(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn source_label(loaded: &Loaded) -> &'static str {
    match loaded.source {
        marginalia_core::LoadSource::Remote => "remote",
        marginalia_core::LoadSource::Local => "local",
    }
}

/// Short description of what a payload holds
pub fn payload_summary(payload: &AnnotationPayload) -> String {
    if payload.is_empty() {
        return "empty".to_string();
    }
    format!(
        "{} drawing{}, {} text{}",
        payload.drawings.len(),
        plural(payload.drawings.len()),
        payload.texts.len(),
        plural(payload.texts.len())
    )
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Format a byte count for humans
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{Stroke, TextAnnotation, Tool};

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_payload_summary() {
        assert_eq!(payload_summary(&AnnotationPayload::new()), "empty");

        let payload = AnnotationPayload::new()
            .with_drawing(Stroke::new(Tool::Pen, "#000", "M0 0"))
            .with_text(TextAnnotation::new("a", 0.0, 0.0))
            .with_text(TextAnnotation::new("b", 0.0, 0.0));
        assert_eq!(payload_summary(&payload), "1 drawing, 2 texts");
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }
}
