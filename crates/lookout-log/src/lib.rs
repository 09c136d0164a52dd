// ABOUTME: Shared logging setup for lookout binaries
// ABOUTME: init_for() installs a stderr subscriber filtered to the named crates

use tracing_subscriber::EnvFilter;

/// Build the filter used by [`init_for`]: WARN for everything, INFO for the
/// named crates. `RUST_LOG` directives are parsed first and the defaults are
/// layered on top.
pub fn filter_for(crate_names: &[&str]) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into());
    for name in crate_names {
        let directive = format!("{}=info", name.replace('-', "_"));
        filter = filter.add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        );
    }
    filter
}

/// Crate-filtered logging to stderr. Default: INFO for the named crates, WARN
/// for everything else.
pub fn init_for(crate_names: &[&str]) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(crate_names))
        .with_target(true)
        .init();
}
