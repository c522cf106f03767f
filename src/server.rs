use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};

use crate::app::AppData;
use crate::error::VisitError;

impl IntoResponse for VisitError {
    fn into_response(self) -> Response {
        let status = if self.is_retryable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, "Database Error").into_response()
    }
}

pub fn build_router(data: AppData) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .with_state(data)
}

async fn index(State(data): State<AppData>) -> Result<Html<String>, VisitError> {
    let count = data.visits.record_visit().await?;
    Ok(Html(render_index(&data.title, count)))
}

async fn healthz() -> &'static str {
    "OK"
}

fn render_index(title: &str, total_visits: u64) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{title}</title>
</head>
<body>
  <h1>{title}</h1>
  <p>This page has been visited <strong id="total-visits">{total_visits}</strong> times.</p>
</body>
</html>
"#
    )
}

/// Serve until Ctrl-C.
pub async fn serve(data: AppData, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("fail to bind port {port}"))?;

    tracing::info!("App running on port {port}");

    axum::serve(listener, build_router(data))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .with_context(|| "http server exited with error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("fail to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[test]
fn render_shows_count() {
    let page = render_index("Visits", 42);
    assert!(page.contains(r#"<strong id="total-visits">42</strong>"#));
    assert!(page.contains("<title>Visits</title>"));
}
