//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// stderr fmt layer shared by every binary of the workspace
pub fn get_fmt_layer<S>() -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry()
        .with(get_fmt_layer().with_filter(env_filter))
        .init();
}
