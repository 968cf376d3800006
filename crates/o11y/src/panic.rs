use metrics::counter;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::{panic, thread};
use tracing::{error, info};

static INSTALLED: OnceCell<&'static str> = OnceCell::new();

fn payload_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Install a panic hook that logs, counts per component, and then defers to
/// the previous hook so backtraces still print.
pub fn install_hook(component: &'static str) {
    if INSTALLED.set(component).is_err() {
        return;
    }

    let prev = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".into());
        let payload = payload_text(panic_info.payload());

        error!(component, thread = %thread_name, %location, %payload, "panic captured");
        counter!("schemawatch_panics_total", "component" => component)
            .increment(1);

        prev(panic_info);
    }));

    info!(component, "panic hook installed");
}
