use axum::http::HeaderValue;
use binsight_core::{build_app_with_state, load_service_policy, ServiceFlags};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = ServiceFlags::from_env();

    // Keep the guard alive for the whole process so buffered lines are flushed.
    let (file_layer, _log_guard) = match &flags.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "binsight.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let policy = load_service_policy(&flags.policy_path)?;
    let addr = flags.socket_addr()?;
    let allowed_origin = HeaderValue::from_str(&flags.allowed_origin).unwrap_or_else(|_| {
        tracing::warn!(
            origin = %flags.allowed_origin,
            "invalid allowed origin, falling back to http://127.0.0.1:8080"
        );
        HeaderValue::from_static("http://127.0.0.1:8080")
    });

    let (app, state) = build_app_with_state(policy, flags, allowed_origin);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    state.set_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
