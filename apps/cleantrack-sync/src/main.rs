use anyhow::{Context, Result};
use cleantrack_sync::config::Config;
use cleantrack_sync::error::SyncError;
use cleantrack_sync::http::{self, HttpState};
use cleantrack_sync::model::Category;
use cleantrack_sync::mqtt::MqttSnapshotSource;
use cleantrack_sync::osrm::OsrmRoutingProvider;
use cleantrack_sync::session::{spawn_session, ErrorReporter, SyncSession};
use cleantrack_sync::surface::MemorySurface;
use cleantrack_sync::visibility::VisibilityFilter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cleantrack_sync=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "cleantrack-sync"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn log_reporter() -> ErrorReporter {
    Arc::new(|fault: &SyncError| match fault {
        SyncError::ReconciliationInvariantViolation { .. } => {
            tracing::error!(error=%fault, "sync fault")
        }
        _ => tracing::warn!(error=%fault, "sync fault"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let source = Arc::new(MqttSnapshotSource::from_config(&config));
    let router = Arc::new(
        OsrmRoutingProvider::new(
            &config.routing_url,
            &config.routing_profile,
            config.routing_timeout(),
        )
        .context("failed to build routing client")?,
    );
    let session = SyncSession::new(
        MemorySurface::new(),
        VisibilityFilter::new(config.default_layers),
        config.viewport(),
    )
    .with_error_reporter(log_reporter());
    let (handle, session_task) = spawn_session(session, source, router, config.session_options());

    for category in Category::ALL {
        handle.subscribe(category).await?;
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = http::router(HttpState {
        session: handle.clone(),
    })
    .layer(cors);

    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind cleantrack-sync listener on {}", config.http_bind))?;
    tracing::info!(addr = %config.http_bind, "cleantrack-sync listening");

    tokio::select! {
        res = axum::serve(listener, app) => {
            if let Err(err) = res { tracing::error!(error=%err, "HTTP server failed"); }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let removed = handle.shutdown().await?;
    tracing::info!(markers = removed, "map cleared");
    if let Err(err) = session_task.await {
        tracing::warn!(error=%err, "session task failed");
    }

    Ok(())
}
