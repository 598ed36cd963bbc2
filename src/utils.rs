use std::path::PathBuf;

use anyhow::bail;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

/// 获取当前时间
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Round a percentage to two decimals and clamp it into `0..=100`.
pub fn clamp_percentage(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    ((value * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// 初始化日志
pub fn init_log(log: Option<PathBuf>) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let subscriber_builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true);
    let (non_blocking, guard) = if let Some(log) = log {
        // output to file，daily rotate, non-blocking
        if !log.is_dir() {
            bail!("log path {} is not a directory", log.display());
        }
        let file_appender = tracing_appender::rolling::daily(log, "course_server.log");
        tracing_appender::non_blocking(file_appender)
    } else {
        // output to stdout
        tracing_appender::non_blocking(std::io::stdout())
    };
    tracing::subscriber::set_global_default(
        subscriber_builder.with_writer(non_blocking).finish(),
    )?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_rounded_and_clamped() {
        assert_eq!(clamp_percentage(66.666_666), 66.67);
        assert_eq!(clamp_percentage(120.0), 100.0);
        assert_eq!(clamp_percentage(-3.0), 0.0);
        assert_eq!(clamp_percentage(f64::NAN), 0.0);
    }
}
