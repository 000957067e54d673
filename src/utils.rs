use tracing_subscriber::EnvFilter;

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `0.00123` as `"0.1230%"`.
pub fn pct(v: f64) -> String {
    format!("{:.4}%", v * 100.0)
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` for this crate with `verbose`.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info,fx_cycle_arb=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
