//! Compact, colored log format for terminals.
//!
//! ```text
//! [INFO ] 10-18|14:03:11.284 publisher  batch published  acknowledged=10 retried=0
//! ```
use std::{fmt, io};

use nu_ansi_term::{Color, Style};
use tracing::{Event, Level, Subscriber, field, span};
use tracing_subscriber::{
    field::{RecordFields, VisitFmt, VisitOutput},
    fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format::Writer},
    registry::LookupSpan,
};

const MESSAGE_WIDTH: usize = 40;
const TARGET_WIDTH: usize = 10;

pub struct BridgeFormat {
    time_format: time::format_description::OwnedFormatItem,
}

impl<S, N> FormatEvent<S, N> for BridgeFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let ansi = writer.has_ansi_escapes();

        write!(writer, "{} ", LevelTag::new(meta.level(), ansi))?;
        if self.format_time(&mut writer).is_err() {
            write!(writer, "<unknown-time>")?;
        }

        let target = short_target(meta.target());
        if ansi {
            let dimmed = Style::new().dimmed();
            write!(
                writer,
                " {}{:<width$}{} ",
                dimmed.prefix(),
                target,
                dimmed.suffix(),
                width = TARGET_WIDTH
            )?;
        } else {
            write!(writer, " {:<width$} ", target, width = TARGET_WIDTH)?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

impl<'w> FormatFields<'w> for BridgeFormat {
    fn format_fields<R: RecordFields>(&self, writer: Writer<'w>, fields: R) -> fmt::Result {
        let mut visitor = FieldVisitor::new(writer, true);
        fields.record(&mut visitor);
        visitor.finish()
    }

    fn add_fields(
        &self,
        current: &'w mut FormattedFields<Self>,
        fields: &span::Record<'_>,
    ) -> fmt::Result {
        let empty = current.is_empty();
        let mut visitor = FieldVisitor::new(current.as_writer(), empty);
        fields.record(&mut visitor);
        visitor.finish()
    }
}

impl BridgeFormat {
    fn format_time(&self, writer: &mut Writer<'_>) -> fmt::Result {
        let now = time::OffsetDateTime::from(std::time::SystemTime::now());
        let mut adaptor = WriteAdaptor { inner: writer };
        now.format_into(&mut adaptor, &self.time_format)
            .map_err(|_| fmt::Error)?;
        Ok(())
    }
}

impl Default for BridgeFormat {
    fn default() -> Self {
        // PANIC: the format description is a constant.
        let time_format = time::format_description::parse_owned::<2>(
            "[month]-[day]|[hour]:[minute]:[second].[subsecond digits:3]",
        )
        .expect("valid time format");

        Self { time_format }
    }
}

/// The last segment of a module path: `geobridge_core::publisher` becomes
/// `publisher`.
fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

struct FieldVisitor<'a> {
    writer: Writer<'a>,
    is_empty: bool,
    result: fmt::Result,
}

impl<'a> FieldVisitor<'a> {
    fn new(writer: Writer<'a>, is_empty: bool) -> Self {
        Self {
            writer,
            is_empty,
            result: Ok(()),
        }
    }

    fn separator(&mut self) -> &'static str {
        if std::mem::take(&mut self.is_empty) {
            ""
        } else {
            " "
        }
    }

    fn field_color(name: &str) -> Color {
        match name {
            "err" | "error" => Color::Red,
            "source_id" | "session_id" => Color::Cyan,
            _ => Color::Blue,
        }
    }
}

impl field::Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.record_debug(field, &format_args!("{value}"))
        } else {
            self.record_debug(field, &value)
        }
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        if self.result.is_err() {
            return;
        }

        let separator = self.separator();
        let name = field.name();

        self.result = if name == "message" {
            write!(
                self.writer,
                "{separator}{:<width$}",
                format!("{value:?}"),
                width = MESSAGE_WIDTH
            )
        } else if self.writer.has_ansi_escapes() {
            let color = Self::field_color(name);
            write!(
                self.writer,
                "{separator}{name}={}",
                color.paint(format!("{value:?}"))
            )
        } else {
            write!(self.writer, "{separator}{name}={value:?}")
        };
    }
}

impl VisitOutput<fmt::Result> for FieldVisitor<'_> {
    fn finish(self) -> fmt::Result {
        self.result
    }
}

impl VisitFmt for FieldVisitor<'_> {
    fn writer(&mut self) -> &mut dyn fmt::Write {
        &mut self.writer
    }
}

struct LevelTag<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> LevelTag<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

impl fmt::Display for LevelTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, color) = match *self.level {
            Level::TRACE => ("TRACE", Color::Purple),
            Level::DEBUG => ("DEBUG", Color::Blue),
            Level::INFO => ("INFO ", Color::Green),
            Level::WARN => ("WARN ", Color::Yellow),
            Level::ERROR => ("ERROR", Color::Red),
        };

        if self.ansi {
            write!(f, "[{}]", color.paint(label))
        } else {
            write!(f, "[{label}]")
        }
    }
}

/// Lets `time` write into a `fmt::Write`.
struct WriteAdaptor<'a> {
    inner: &'a mut dyn fmt::Write,
}

impl io::Write for WriteAdaptor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = std::str::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.write_str(s).map_err(io::Error::other)?;
        Ok(s.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
