use log::info;

const DEFAULT_FILTER: &str = "info";

/// Initialize the global logger. `RUST_LOG` overrides the default filter.
///
/// Calling it more than once is harmless, every test binary may call it in each test.
pub fn init_log() {
    init_log_with_filter(DEFAULT_FILTER);
}

pub fn init_log_with_filter(default_filter: &str) {
    use chrono::Utc;
    use std::io::Write;

    let env = env_logger::Env::default().default_filter_or(default_filter);
    let ret = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                level_style.value(record.level()),
                record.file().unwrap_or("<unnamed>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .try_init();

    if ret.is_ok() {
        info!("env_logger initialized");
    }
}
