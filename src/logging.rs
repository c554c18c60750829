//! 终端日志: 按级别着色, 带本地时间戳. 级别由环境变量 `LOG` 决定 (error/warn/info/debug/trace), 默认关闭

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        use Level::*;
        let color = match record.level() {
            Error => 31,
            Warn => 93,
            Info => 34,
            Debug => 32,
            Trace => 90,
        };

        eprintln!(
            "\u{1B}[{}m[{:<5}] [{}] [{}] {}\u{1B}[0m",
            color,
            record.level(),
            Local::now().format("%H:%M:%S%.3f"),
            std::thread::current().name().unwrap_or("-"),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// 安装日志. 重复调用时保留第一次安装的日志, 只更新级别
pub fn init() {
    static LOGGER: Logger = Logger;
    let _ = log::set_logger(&LOGGER);

    let level = std::env::var("LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Off);
    log::set_max_level(level);
}
