use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chunkyard::blobstore::FsBlobStore;
use chunkyard::registry::FjallRegistry;
use chunkyard::{ChunkRecord, ChunkUpload, Config, FinalArtifact, UploadError, UploadStore};
use clap::Parser;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Store = UploadStore<FsBlobStore, FjallRegistry>;

/// Accepts chunked uploads over HTTP and combines them into files.
#[derive(Parser, Debug)]
#[command(name = "chunkyard", version, about, long_about = None)]
struct Args {
    /// Directory holding the blobs and the chunk registry
    #[arg(long, env = "CHUNKYARD_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[arg(long, env = "CHUNKYARD_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Buffer size used to stream chunks while combining
    #[arg(long, env = "CHUNKYARD_COPY_BUFFER_SIZE", default_value_t = 64 * 1024)]
    copy_buffer_size: usize,

    /// Largest `total_chunks` an upload may announce
    #[arg(long, env = "CHUNKYARD_MAX_TOTAL_CHUNKS", default_value_t = 100_000)]
    max_total_chunks: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let blobs = FsBlobStore::new(args.data_dir.join("blobs"))
        .await
        .context("failed to open blob directory")?;
    let registry =
        FjallRegistry::open(args.data_dir.join("registry")).context("failed to open registry")?;
    let store = UploadStore::new(blobs, registry).with_config(Config {
        copy_buffer_size: args.copy_buffer_size,
        max_total_chunks: args.max_total_chunks,
    });

    let app = Router::new()
        .route("/upload/{upload_id}/{chunk_index}", post(upload_chunk))
        .route("/files", get(list_files))
        .route("/combine-chunks/{upload_id}", post(combine_chunks))
        .with_state(Arc::new(store));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(addr = %args.listen, data_dir = %args.data_dir.display(), "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChunkParams {
    total_chunks: u32,
    name: String,
    #[serde(default = "default_mime_type")]
    mime_type: String,
}

fn default_mime_type() -> String {
    "application/octet-stream".into()
}

async fn upload_chunk(
    State(store): State<Arc<Store>>,
    Path((upload_id, chunk_index)): Path<(String, u32)>,
    Query(params): Query<ChunkParams>,
    body: Body,
) -> Result<Json<ChunkRecord>, ApiError> {
    let chunk = ChunkUpload {
        upload_id,
        chunk_index,
        total_chunks: params.total_chunks,
        original_name: params.name,
        mime_type: params.mime_type,
    };
    let bytes = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));

    let record = store.submit_chunk(chunk, bytes).await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct FileList {
    files: Vec<ChunkRecord>,
}

async fn list_files(State(store): State<Arc<Store>>) -> Result<Json<FileList>, ApiError> {
    let files = store.list_files()?;
    Ok(Json(FileList { files }))
}

async fn combine_chunks(
    State(store): State<Arc<Store>>,
    Path(upload_id): Path<String>,
) -> Result<Json<FinalArtifact>, ApiError> {
    let artifact = store.combine_chunks(&upload_id).await?;
    Ok(Json(artifact))
}

struct ApiError(UploadError);

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<Vec<u32>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            UploadError::Validation(_) => StatusCode::BAD_REQUEST,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::IncompleteUpload { .. } | UploadError::Conflict(_) => StatusCode::CONFLICT,
            UploadError::CorruptUpload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::Reassembly { .. } | UploadError::Storage(_) => {
                tracing::error!(error = ?self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let missing = match &self.0 {
            UploadError::IncompleteUpload { missing, .. } => Some(missing.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            missing,
        };
        (status, Json(body)).into_response()
    }
}
