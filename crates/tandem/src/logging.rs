use tracing::Subscriber;
use tracing_subscriber::{
  EnvFilter, Layer, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

pub fn init(app_name: &str) -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(build_loglevel_filter_layer(format!(
      "info,{app_name}=debug"
    )))
    .with(build_logger_text())
    .init();
  Ok(())
}

pub fn build_logger_text<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
  S: Subscriber + for<'a> LookupSpan<'a>,
{
  Box::new(
    tracing_subscriber::fmt::layer()
      .with_target(true)
      .with_timer(tracing_subscriber::fmt::time::time()),
  )
}

pub fn build_loglevel_filter_layer<S: Into<String>>(default_log: S) -> EnvFilter {
  // RUST_LOG wins over the baked-in default.
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_log.into()))
}
