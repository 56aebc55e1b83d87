use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;

use funnel_assist::analytics::{AnalyticsState, analytics_routes};
use funnel_assist::channels::{ChannelGateway, WebhookState, WhatsAppGateway, webhook_routes};
use funnel_assist::clock::{Clock, SystemClock};
use funnel_assist::config::FunnelConfig;
use funnel_assist::conversations::{ConversationState, conversation_routes};
use funnel_assist::dispatch::{DispatchEngine, DripScheduler, spawn_deferred_loop, spawn_drip_ticker};
use funnel_assist::funnel::ContentCatalog;
use funnel_assist::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match FunnelConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("  export META_ACCESS_TOKEN=... PHONE_NUMBER_ID=... VERIFY_TOKEN=...");
            std::process::exit(1);
        }
    };

    eprintln!("📋 Funnel Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   Analytics: http://0.0.0.0:{}/api/analytics/dashboard", config.port);
    eprintln!("   Conversations: http://0.0.0.0:{}/api/conversations", config.port);

    // ── Store ─────────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Engine ────────────────────────────────────────────────────────────
    let gateway: Arc<dyn ChannelGateway> = Arc::new(WhatsAppGateway::new(config.whatsapp.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let catalog = ContentCatalog::new(config.content.clone(), config.presentation_delay);
    let engine = Arc::new(DispatchEngine::new(Arc::clone(&db), gateway, clock, catalog));

    let _deferred_handle = spawn_deferred_loop(Arc::clone(&engine), config.deferred_poll_interval);

    // ── Drip ──────────────────────────────────────────────────────────────
    let drip = Arc::new(DripScheduler::new(Arc::clone(&engine), config.drip.batch_limit));
    let _drip_handle = if config.drip.enabled {
        let handle = spawn_drip_ticker(Arc::clone(&drip), &config.drip.schedule)
            .context("invalid drip schedule")?;
        eprintln!("   Drip: enabled ({})", config.drip.schedule);
        Some(handle)
    } else {
        eprintln!("   Drip: disabled");
        None
    };

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = webhook_routes(WebhookState {
        engine: Arc::clone(&engine),
        verify_token: config.whatsapp.verify_token.clone(),
    })
    .merge(analytics_routes(AnalyticsState {
        engine: Arc::clone(&engine),
        drip,
    }))
    .merge(conversation_routes(ConversationState {
        engine: Arc::clone(&engine),
    }))
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");
    eprintln!();

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
