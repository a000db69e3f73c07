use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "plugmon",
    about = "TP-Link HS110 smart plug power monitor with InfluxDB output"
)]
pub struct Config {
    /// Plug IP address
    #[arg(long, default_value = "192.168.1.1")]
    pub ip: String,

    /// Plug TCP port
    #[arg(long, default_value_t = crate::plug::DEFAULT_PORT)]
    pub port: u16,

    /// InfluxDB url, e.g. http://yourserver:8086 (empty disables publishing)
    #[arg(long = "influxurl", default_value = "")]
    pub influx_url: String,

    /// InfluxDB database to write to
    #[arg(long = "influxdb", default_value = "sensors")]
    pub influx_database: String,

    /// Measurement name for written points
    #[arg(long, default_value = "tplink-HS110")]
    pub measurement: String,

    /// Console log level
    #[arg(long = "loglevel", value_enum, ignore_case = true, default_value = "INFO")]
    pub log_level: LogLevel,

    /// Seconds between readings
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_secs: u64,

    /// Number of readings in the moving average
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u32).range(1..))]
    pub window: u32,

    /// Start the moving average from a window full of zeros
    #[arg(long)]
    pub zero_fill: bool,

    /// What to do when the plug cannot be read
    #[arg(long, value_enum, default_value = "skip")]
    pub on_read_error: ReadErrorPolicy,

    /// Plug and InfluxDB network timeout in seconds
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: u64,

    /// Value of the host tag (defaults to this machine's hostname)
    #[arg(long)]
    pub hostname: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    #[value(name = "DEBUG")]
    Debug,
    #[value(name = "INFO")]
    Info,
    #[value(name = "WARN")]
    Warn,
    #[value(name = "ERROR")]
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadErrorPolicy {
    /// Log the failure and wait for the next tick
    Skip,
    /// Log the failure and exit with a non-zero status
    Fatal,
}

/// Best-effort local hostname for the host tag.
pub fn local_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
