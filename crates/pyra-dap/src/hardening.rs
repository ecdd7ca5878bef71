use std::io::Write as _;
use std::sync::{Arc, Once};

use pyra_config::{init_tracing, LogBuffer, PyraConfig};

static PANIC_HOOK: Once = Once::new();

/// Log lines echoed to stderr when the process panics.
const CRASH_LOG_LINES: usize = 50;

/// Initialize structured logging and install a global panic hook for the
/// process.
///
/// The hook records panics through `tracing` (so they land in the log buffer
/// and any configured log file), dumps the tail of the log buffer to stderr,
/// and then defers to the previous hook.
pub fn init(config: &PyraConfig) -> Arc<LogBuffer> {
    let buffer = init_tracing(&config.logging);
    install_panic_hook(config.logging.include_backtrace, buffer.clone());
    buffer
}

fn install_panic_hook(include_backtrace: bool, buffer: Arc<LogBuffer>) {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|loc| loc.to_string())
                .unwrap_or_else(|| "<unknown>".to_owned());
            let message = panic_message(info);
            if include_backtrace {
                let backtrace = std::backtrace::Backtrace::force_capture();
                tracing::error!(
                    target: "pyra.panic",
                    message = %message,
                    location = %location,
                    backtrace = %backtrace,
                    "panic captured"
                );
            } else {
                tracing::error!(
                    target: "pyra.panic",
                    message = %message,
                    location = %location,
                    "panic captured"
                );
            }
            if let Some(report) = crash_report(&buffer, CRASH_LOG_LINES) {
                let _ = std::io::stderr().write_all(report.as_bytes());
            }
            previous(info);
        }));
    });
}

/// Render the most recent `max_lines` buffered log lines, or `None` when
/// nothing has been logged yet.
fn crash_report(buffer: &LogBuffer, max_lines: usize) -> Option<String> {
    let lines = buffer.last_lines(max_lines);
    if lines.is_empty() {
        return None;
    }
    let mut report = format!("--- last {} log lines ---\n", lines.len());
    for line in lines {
        report.push_str(&line);
        report.push('\n');
    }
    Some(report)
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
