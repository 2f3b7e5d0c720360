//! remlaunch exec agent
//!
//! A small HTTP service for hosts that are reachable over the network but not
//! over SSH. It accepts file uploads and runs shell commands, answering in the
//! JSON shapes defined by `remlaunch-protocol`.
//!
//! Routes:
//! - `PUT /files/*path`: stream the body into `path`, replacing it
//! - `POST /files/*path?overwrite=<bool>`: write or append the body
//! - `POST /exec`: run `cmd` or fan out `cmds`, optionally with a timeout
//!
//! There is no authentication. Bind it to an interface only trusted callers
//! can reach.

pub mod config;
pub mod error;
pub mod handlers;

pub use config::{AgentConfig, AgentState};
pub use error::AgentError;

use axum::routing::{post, put};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Build the agent's router over the given state.
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route(
            "/files/*path",
            put(handlers::files::put_file).post(handlers::files::post_file),
        )
        .route(remlaunch_protocol::EXEC_ROUTE, post(handlers::exec::exec))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until the process is stopped.
pub async fn serve_listener(listener: TcpListener, state: AgentState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, root = %state.file_root().display(), "exec agent listening");
    }
    axum::serve(listener, router(state)).await
}

/// Bind the configured address and serve.
pub async fn serve(config: AgentConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let state = AgentState::from_config(&config)?;
    serve_listener(listener, state).await
}
