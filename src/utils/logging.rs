use std::io::Write;
use std::sync::Once;

/// Init log. Honours `RUST_LOG`, defaults to `info`.
pub fn init_log(default_level: log::LevelFilter) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(default_level)
        .parse_default_env()
        .init();
}

static INIT_LOG: Once = Once::new();

/// Setup logging once per process.
pub fn setup_log() {
    INIT_LOG.call_once(|| {
        init_log(log::LevelFilter::Info);
    });
}
