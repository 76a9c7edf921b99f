//! Tracing setup for the CLI.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{format::FmtSpan, Layer as FmtLayer},
    layer::SubscriberExt as _,
    Registry,
};

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

pub(crate) fn set_up(options: &Options) -> Result<()> {
    let filter = if options.verbose {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };

    let span_events = if options.verbose {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = FmtLayer::new()
        .with_span_events(span_events)
        .with_ansi(options.color)
        .with_writer(std::io::stderr);
    let subscriber = Registry::default().with(filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("failed to set up tracing: {}", e))?;

    Ok(())
}
