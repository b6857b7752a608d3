use env_logger::Builder;
use std::io::Write;

/// Initialize the process-wide logger. Safe to call more than once per
/// process only through [`init_once`]; a bare second call to `env_logger`
/// would panic.
pub fn init_log() {
    let mut builder = Builder::from_default_env();
    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

/// `init_log` wrapped in a `Once`, for tests and for embedders that may
/// construct more than one `Defragmenter` in the same process.
pub fn init_once() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(init_log);
}
