use ipc_log::StaticLogConfig;

/// Static log rotation policy for the `ipc-gateway` binary, plugged into
/// `ipc_log::init::<LogConfig>`.
pub struct LogConfig;

impl StaticLogConfig for LogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "ipc-gateway";
}
