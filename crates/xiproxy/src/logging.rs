//! Shared logging setup for the service binaries.

/// Log arguments matching the conventions of the sibling services, so
/// deployments configure them all the same way.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity: an env-filter directive such as
    /// `info` or `xiproxy=debug,warn`.
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
