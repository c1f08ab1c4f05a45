//! Status page and metrics endpoint
//!
//! Two read-only routes, both backed by the anchor:
//!
//! - `GET /` renders name, domain, region and the assigned CIDR
//! - `GET /metrics` is the anchor's own metrics handler
//!
//! The page template is looked up as `template.html` next to the executable.
//! When it is missing the embedded default is written there first, so
//! operators get an editable copy on first run.

use crate::anchor::Anchor;
use crate::error::{PortalError, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// File name of the on-disk template override
pub const TEMPLATE_FILE: &str = "template.html";

const EMBEDDED_TEMPLATE: &str = include_str!("template.html");

#[derive(Clone)]
struct StatusState {
    anchor: Arc<dyn Anchor>,
    template_dir: Option<PathBuf>,
}

/// Directory containing the running executable
pub fn executable_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Build the status router.
///
/// `template_dir` is where `template.html` is looked up and extracted to;
/// with `None` the embedded template is always used.
pub fn build_router(anchor: Arc<dyn Anchor>, template_dir: Option<PathBuf>) -> Router {
    let metrics = anchor.metrics_handler();
    let state = StatusState {
        anchor,
        template_dir,
    };

    Router::new()
        .route("/", get(status_page))
        .with_state(state)
        .route("/metrics", metrics)
}

async fn status_page(State(state): State<StatusState>) -> Response {
    let cidr = match state.anchor.cidr().await {
        Ok(cidr) => cidr,
        Err(e) => {
            error!(error = %e, "Failed to get CIDR for status page");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to get CIDR" })),
            )
                .into_response();
        }
    };

    let name = state.anchor.name();
    let domain = state.anchor.domain();
    let region = state.anchor.region();

    let template = load_template(state.template_dir.as_deref()).await;
    let page = render(
        &template,
        &[
            ("name", name.as_str()),
            ("domain", domain.as_str()),
            ("region", region.as_str()),
            ("cidr", cidr.as_str()),
        ],
    );
    Html(page).into_response()
}

/// Read the template from `dir`, extracting the embedded one if absent.
///
/// Any filesystem failure falls back to the embedded template.
pub async fn load_template(dir: Option<&Path>) -> String {
    let Some(dir) = dir else {
        return EMBEDDED_TEMPLATE.to_string();
    };
    let path = dir.join(TEMPLATE_FILE);

    match tokio::fs::read_to_string(&path).await {
        Ok(template) => template,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            match tokio::fs::write(&path, EMBEDDED_TEMPLATE).await {
                Ok(()) => info!(path = %path.display(), "Extracted default status template"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write template"),
            }
            EMBEDDED_TEMPLATE.to_string()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read template");
            EMBEDDED_TEMPLATE.to_string()
        }
    }
}

/// Substitute `{{key}}` placeholders with HTML-escaped values
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut page = template.to_string();
    for (key, value) in values {
        page = page.replace(&format!("{{{{{}}}}}", key), &escape_html(value));
    }
    page
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Running status HTTP server
pub struct StatusServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusServer {
    /// Bind `addr` and serve `router` on a background task
    pub async fn start(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PortalError::Status(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Status server failed");
            }
            debug!("Status server shut down");
        });

        info!(bind = %local_addr, "Status server listening");
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Status server task ended abnormally");
        }
    }
}
