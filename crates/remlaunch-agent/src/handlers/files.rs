//! File upload handlers.
//!
//! Bodies are streamed straight to disk chunk by chunk, so uploads are not
//! bounded by the request-body limit that buffering extractors apply.

use std::path::Path;

use axum::body::Body;
use axum::extract::{self, Query, State};
use axum::Json;
use futures::StreamExt;
use remlaunch_protocol::{FileAck, WriteQuery};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::{AgentError, AgentState};

/// `PUT /files/*path`: replace the file with the request body.
pub async fn put_file(
    State(state): State<AgentState>,
    extract::Path(path): extract::Path<String>,
    body: Body,
) -> Result<Json<FileAck>, AgentError> {
    let target = state.resolve(&path);
    let bytes = write_body(&target, body, false).await?;
    tracing::info!(path = %target.display(), bytes, "file uploaded");
    Ok(Json(FileAck {
        path: target.display().to_string(),
        bytes,
    }))
}

/// `POST /files/*path?overwrite=<bool>`: replace or append.
pub async fn post_file(
    State(state): State<AgentState>,
    extract::Path(path): extract::Path<String>,
    Query(query): Query<WriteQuery>,
    body: Body,
) -> Result<Json<FileAck>, AgentError> {
    let target = state.resolve(&path);
    let append = !query.overwrite();
    let bytes = write_body(&target, body, append).await?;
    tracing::info!(path = %target.display(), bytes, append, "file updated");
    Ok(Json(FileAck {
        path: target.display().to_string(),
        bytes,
    }))
}

async fn write_body(target: &Path, body: Body, append: bool) -> Result<u64, AgentError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(target)
        .await?;

    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AgentError::Body(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}
