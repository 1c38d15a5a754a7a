mod ui;

use tracing_subscriber::EnvFilter;

use companion_core::config::CompanionConfig;
use companion_core::runtime::CompanionRuntime;
use ui::console::ConsoleApp;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion=debug,companion_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Companion starting...");

    let config = CompanionConfig::load();
    if config
        .chat
        .api_key
        .as_deref()
        .map(|key| key.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!("No chat API key configured; set COMPANION_API_KEY or [chat].api_key");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let (event_tx, event_rx) = flume::unbounded();
    let runtime = match CompanionRuntime::bootstrap(config, event_tx, rt.handle().clone()) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to initialize companion: {:#}", e);
            std::process::exit(1);
        }
    };

    if runtime.spawn_announcer().is_some() {
        tracing::info!("Hourly announcements enabled");
    }

    let mut app = ConsoleApp::new(runtime.companion.clone(), event_rx);
    if let Err(e) = app.run() {
        tracing::error!("Console error: {:#}", e);
        std::process::exit(1);
    }
}
