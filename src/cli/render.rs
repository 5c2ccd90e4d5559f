use crate::classify::record::CanonicalLogRecord;
use chrono::SecondsFormat;
use console::style;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writes records to a terminal or pipe, one per line.
pub struct Renderer<W> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn render(&mut self, record: &CanonicalLogRecord) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, record)?;
                writeln!(self.out)
            }
            OutputFormat::Text => {
                let line = format_line(record);
                if record.stderr {
                    writeln!(self.out, "{}", style(line).red())
                } else {
                    writeln!(self.out, "{}", line)
                }
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// `<rfc3339 time> <service> <host> <message>`, with `-` for unknown fields.
pub fn format_line(record: &CanonicalLogRecord) -> String {
    let time = record
        .time()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| record.timestamp.to_string());

    format!(
        "{} {} {} {}",
        time,
        or_dash(&record.service),
        or_dash(&record.host),
        record.message.trim_end()
    )
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
