use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tab_stream_core::browser::Browser;
use tab_stream_core::capture::{self, test::TestBrowser};
use tab_stream_core::channels::StaticChannelDirectory;
use tab_stream_core::profile::ProfileRegistry;
use tab_stream_core::settings::Settings;
use tab_stream_core::stream_manager::StreamManager;
use tab_stream_core::{background, http};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;
    let settings: Settings = builder.try_deserialize()?;
    settings.validate()?;

    // this binary runs the pipeline against the synthetic test-pattern
    // browser; production embeds the library with a real browser backend
    let browser: Arc<dyn Browser> = Arc::new(TestBrowser::default());
    info!("test-pattern browser active");

    capture::capture_probe(&browser, &settings).await?;

    let channels = Arc::new(StaticChannelDirectory::new(&settings.channels));
    let manager = StreamManager::new(
        settings.clone(),
        browser,
        channels,
        ProfileRegistry::default(),
    );

    let shutdown = CancellationToken::new();
    let reaper = manager.spawn_idle_reaper(shutdown.clone());
    let show_info = settings
        .show_info
        .clone()
        .map(|cfg| background::showinfo::spawn(manager.clone(), cfg, shutdown.clone()));

    let addr: SocketAddr = settings.listen_http.parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on http://{}", addr);

    let app = http::router(manager.clone());
    let signal_token = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        signal_token.cancel();
    })
    .await?;

    manager.terminate_all("server shutting down").await;
    shutdown.cancel();
    let _ = reaper.await;
    if let Some(task) = show_info {
        let _ = task.await;
    }
    info!("server closed");
    Ok(())
}
