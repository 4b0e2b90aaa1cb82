use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "media_dl=info";

/// Filter used by `--verbose`
pub const VERBOSE_LOG_FILTER: &str = "media_dl=debug";

/// Install the global subscriber. Returns `false` when one is already set.
pub fn init_tracing(verbose: bool) -> bool {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
    };

    // progress bars own stdout
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!("Tracing already initialised, keeping it: {}", err);
            false
        }
    }
}
