//! Logging setup matching the sibling services.

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity: an env-filter directive such as
    /// `info` or `dbman=debug,warn`.
    #[arg(long = "log.level", default_value = "info", env = "LOG_LEVEL", global = true)]
    pub level: String,
}

/// Initializes logging to stderr. Panics if called twice.
pub fn init(args: &LogArgs) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.as_str())
        .init();
}
