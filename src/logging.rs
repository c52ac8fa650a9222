//! Custom logging formatter with hostname and role prefix, no ANSI colors
//!
//! Every DTIO process (client, scheduler, worker) logs through the same
//! formatter so that interleaved logs from one node can be told apart:
//! `[hostname/role]` prefix, UTC timestamp, level and thread name, then the
//! span path and source location on the same line. The scheduler's solve
//! threads are named `ts-solve-N`.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter with hostname and role prefix
pub struct HostnameFormatter {
    hostname: String,
    role: String,
}

impl HostnameFormatter {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            hostname: local_hostname(),
            role: role.into(),
        }
    }

    /// Prefix written before every event
    pub fn prefix(&self) -> String {
        format!("[{}/{}]", self.hostname, self.role)
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new("dtio")
    }
}

fn local_hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .unwrap_or("unknown")
        .to_string()
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    /// One line per event:
    /// `[host/role] time LEVEL thread span{..}:span{..} target:file:line: msg`
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let now: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        let thread = std::thread::current();

        write!(
            writer,
            "{} {} {:5} {} ",
            self.prefix(),
            now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level(),
            thread.name().unwrap_or("-")
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, ":")?;
                }
                first = false;
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            if !first {
                write!(writer, " ")?;
            }
        }

        match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => write!(writer, "{}:{}:{}: ", meta.target(), file, line)?,
            _ => write!(writer, "{}: ", meta.target())?,
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize tracing with the hostname formatter
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice in one
/// process is harmless: the second registration is ignored.
pub fn init_with_hostname(level: &str, role: &str) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(HostnameFormatter::new(role))
        .with_writer(std::io::stdout);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized on host: {} as {}", local_hostname(), role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_contains_role() {
        let formatter = HostnameFormatter::new("task_scheduler");
        let prefix = formatter.prefix();
        assert!(prefix.starts_with('['));
        assert!(prefix.ends_with("/task_scheduler]"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_with_hostname("debug", "client");
        init_with_hostname("debug", "client");
    }
}
