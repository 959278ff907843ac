use std::panic;
use std::thread;

/// Install `better_panic` and a hook that records panics in the log file.
/// Panics on image workers are caught by the pool; this only makes sure the
/// thread name ends up next to the message.
pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        log::error!("Thread '{name}' panicked at {location}: {}", payload_text(panic_info));

        default_hook(panic_info);
    }));
}

fn payload_text(panic_info: &panic::PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
