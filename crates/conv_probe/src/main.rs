use anyhow::Result;
use clap::Parser;
use conv_probe::cli::Cli;
use conv_probe::{Inspector, SavedModelRuntime};
use std::io;

fn main() -> Result<()> {
    // 1. Record backtraces on errors unless the user chose otherwise
    if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
        std::env::set_var("RUST_LIB_BACKTRACE", "1");
    }

    let cli = Cli::parse();

    // 2. Setup Logging (stderr, optional rolling file); stdout is the report
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let (file_layer, _guard) = match &cli.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "conv_probe.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    // 3. Setup Panic Hook
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "🔥 CRASH detected at {}: {}", location, msg);
        eprintln!("🔥 CRASH detected at {}: {}", location, msg);
    }));

    let config = cli.resolve_config()?;
    tracing::debug!("Probe config: {:?}", config);

    let runtime = SavedModelRuntime::new(config.tags.clone());
    let inspector = Inspector::new(runtime, config);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let outcome = inspector.run(&mut out)?;
    tracing::debug!("Probe finished: {:?}", outcome);

    Ok(())
}
