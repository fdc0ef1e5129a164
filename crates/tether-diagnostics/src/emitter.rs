//! Report emitters for different output formats.

use crate::counters::Counter;
use crate::report::MemoryReport;
use std::io::Write;

/// Trait for emitting memory reports in various formats.
pub trait ReportEmitter {
    /// Emit a single report.
    fn emit(&mut self, report: &MemoryReport) -> std::io::Result<()>;

    /// Emit multiple reports.
    fn emit_all(&mut self, reports: &[MemoryReport]) -> std::io::Result<()> {
        for report in reports {
            self.emit(report)?;
        }
        Ok(())
    }

    /// Emit a closing line comparing the last report against the first.
    fn emit_summary(&mut self, reports: &[MemoryReport]) -> std::io::Result<()>;
}

/// Terminal output with optional ANSI colors.
pub struct TextEmitter<W: Write> {
    writer: W,
    colored: bool,
}

impl<W: Write> TextEmitter<W> {
    pub fn new(writer: W, colored: bool) -> Self {
        Self { writer, colored }
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.colored {
            code
        } else {
            ""
        }
    }

    fn red(&self) -> &'static str {
        self.paint("\x1b[31m")
    }

    fn green(&self) -> &'static str {
        self.paint("\x1b[32m")
    }

    fn bold(&self) -> &'static str {
        self.paint("\x1b[1m")
    }

    fn reset(&self) -> &'static str {
        self.paint("\x1b[0m")
    }
}

impl<W: Write> ReportEmitter for TextEmitter<W> {
    fn emit(&mut self, report: &MemoryReport) -> std::io::Result<()> {
        let (bold, reset) = (self.bold(), self.reset());
        writeln!(self.writer, "{}Memory: {}{}", bold, report.label, reset)?;
        for counter in Counter::ALL {
            writeln!(
                self.writer,
                "    {:<20} = {}",
                counter.as_str(),
                report.counters.get(counter)
            )?;
        }
        Ok(())
    }

    fn emit_summary(&mut self, reports: &[MemoryReport]) -> std::io::Result<()> {
        let (Some(first), Some(last)) = (reports.first(), reports.last()) else {
            return Ok(());
        };
        let leaks = last.leaks_since(first);
        let reset = self.reset();
        if leaks.is_empty() {
            writeln!(self.writer, "{}no leaks{}", self.green(), reset)
        } else {
            let red = self.red();
            for (counter, count) in leaks {
                writeln!(self.writer, "{}leaked {} {}{}", red, count, counter, reset)?;
            }
            Ok(())
        }
    }
}

/// JSON lines output for tooling integration.
pub struct JsonEmitter<W: Write> {
    writer: W,
}

impl<W: Write> JsonEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> ReportEmitter for JsonEmitter<W> {
    fn emit(&mut self, report: &MemoryReport) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        writeln!(self.writer)?;
        Ok(())
    }

    fn emit_summary(&mut self, reports: &[MemoryReport]) -> std::io::Result<()> {
        let leaks = match (reports.first(), reports.last()) {
            (Some(first), Some(last)) => last.leaks_since(first),
            _ => Vec::new(),
        };
        let summary = serde_json::json!({
            "type": "summary",
            "reports": reports.len(),
            "leaks": leaks
                .iter()
                .map(|(counter, count)| serde_json::json!({
                    "counter": counter.as_str(),
                    "count": count,
                }))
                .collect::<Vec<_>>(),
        });
        serde_json::to_writer(&mut self.writer, &summary)?;
        writeln!(self.writer)?;
        Ok(())
    }
}
