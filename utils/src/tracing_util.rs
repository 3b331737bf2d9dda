//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing with the default configuration.
///
/// Log levels come from `RUST_LOG`; without it only warnings and errors
/// are shown. Output goes to stderr so it never mixes with an archive
/// written to stdout.
pub fn initialize_tracing() {
    // Terse: timestamps and module targets only add noise for a CLI.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
