use crate::decoder::{DecodeError, InferenceDecoder};
use crate::path_resolver::{IngestKind, PathError, PathResolver, ResolvedLocation};
use crate::stats::StatsRegistry;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Field holding the decoded inference, added to stored records
pub const DESERIALIZED_FIELD: &str = "DeserializedData";

const DEVICE_ID_FIELD: &str = "DeviceID";
const INFERENCES_FIELD: &str = "Inferences";
const OUTPUT_FIELD: &str = "O";
const UNKNOWN_DEVICE: &str = "unknown";

/// Errors that abort an ingest operation
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed metadata: {0}")]
    MalformedInput(String),

    #[error("Invalid request path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Failed to decode inference payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to write {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// HTTP-style code reported for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::MalformedInput(_) | IngestError::InvalidPath(_) => 400,
            IngestError::Decode(_) => 422,
            IngestError::Storage { .. } | IngestError::Internal(_) => 500,
        }
    }
}

/// A completed write
#[derive(Debug, Clone)]
pub struct Stored {
    pub file_path: PathBuf,
    pub elapsed_ms: u64,
    pub size_bytes: usize,
}

/// A failed operation, already counted
#[derive(Error, Debug)]
#[error("{error}")]
pub struct IngestFailure {
    #[source]
    pub error: IngestError,
    pub elapsed_ms: u64,
}

/// Receives images and metadata records and persists them
///
/// Every call either writes exactly one file and bumps the matching success
/// counter, or writes nothing and bumps the error counter once.
pub struct IngestPipeline {
    images: PathResolver,
    meta: PathResolver,
    decoder: Option<Arc<dyn InferenceDecoder>>,
    stats: Arc<StatsRegistry>,
}

impl IngestPipeline {
    pub fn new(
        image_dir: impl Into<PathBuf>,
        meta_dir: impl Into<PathBuf>,
        decoder: Option<Arc<dyn InferenceDecoder>>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            images: PathResolver::new(image_dir, IngestKind::Image),
            meta: PathResolver::new(meta_dir, IngestKind::Metadata),
            decoder,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    /// Store an image body verbatim under the image root
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    pub async fn handle_image(&self, raw_path: &str, body: Bytes) -> Result<Stored, IngestFailure> {
        let started = Instant::now();
        let result = self.store_image(raw_path, &body).await;
        self.finish(IngestKind::Image, raw_path, started, result)
    }

    /// Parse, enrich and store a metadata record under the meta root
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    pub async fn handle_metadata(
        &self,
        raw_path: &str,
        body: Bytes,
    ) -> Result<Stored, IngestFailure> {
        let started = Instant::now();
        let result = self.store_metadata(raw_path, &body).await;
        self.finish(IngestKind::Metadata, raw_path, started, result)
    }

    async fn store_image(&self, raw_path: &str, body: &[u8]) -> Result<(PathBuf, usize), IngestError> {
        let location = self.images.resolve(raw_path)?;
        write_file(IngestKind::Image, self.images.root(), &location, body).await?;
        Ok((location.absolute_path, body.len()))
    }

    async fn store_metadata(&self, raw_path: &str, body: &[u8]) -> Result<(PathBuf, usize), IngestError> {
        let location = self.meta.resolve(raw_path)?;

        let mut record = parse_record(body)?;
        let device_id = device_id(&record).to_string();

        if let Some(decoder) = &self.decoder {
            if let Some(encoded) = first_inference_payload(&record)? {
                let decoded = decode_on_blocking_pool(decoder.clone(), encoded).await?;
                record.insert(DESERIALIZED_FIELD.to_string(), decoded);
            } else {
                debug!(device_id = %device_id, "No inferences in record");
            }
        }

        let contents = serde_json::to_vec(&record)
            .map_err(|e| IngestError::Internal(format!("Failed to serialize record: {}", e)))?;
        write_file(IngestKind::Metadata, self.meta.root(), &location, &contents).await?;

        info!(device_id = %device_id, "Metadata record enriched");

        Ok((location.absolute_path, contents.len()))
    }

    fn finish(
        &self,
        kind: IngestKind,
        raw_path: &str,
        started: Instant,
        result: Result<(PathBuf, usize), IngestError>,
    ) -> Result<Stored, IngestFailure> {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((file_path, size_bytes)) => {
                match kind {
                    IngestKind::Image => self.stats.record_image_success(),
                    IngestKind::Metadata => self.stats.record_meta_success(),
                }
                info!(
                    kind = kind.as_str(),
                    path = %raw_path,
                    file_path = %file_path.display(),
                    size_bytes = size_bytes,
                    elapsed_ms = elapsed_ms,
                    "Saved"
                );
                Ok(Stored {
                    file_path,
                    elapsed_ms,
                    size_bytes,
                })
            }
            Err(error) => {
                self.stats.record_error();
                error!(
                    kind = kind.as_str(),
                    path = %raw_path,
                    error = %error,
                    detail = ?error,
                    elapsed_ms = elapsed_ms,
                    "Ingest failed"
                );
                Err(IngestFailure { error, elapsed_ms })
            }
        }
    }
}

/// Parse a request body into a JSON object
pub fn parse_record(body: &[u8]) -> Result<Map<String, Value>, IngestError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(IngestError::MalformedInput(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(IngestError::MalformedInput(e.to_string())),
    }
}

/// `DeviceID` of a record, for logging only
pub fn device_id(record: &Map<String, Value>) -> &str {
    record
        .get(DEVICE_ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_DEVICE)
}

/// `O` of the first inference; `None` when there is nothing to decode
///
/// A missing `O` yields an empty string so the decoder decides whether
/// that is acceptable.
pub fn first_inference_payload(record: &Map<String, Value>) -> Result<Option<String>, IngestError> {
    let inferences = match record.get(INFERENCES_FIELD) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(IngestError::MalformedInput(format!(
                "`{}` must be an array, got {}",
                INFERENCES_FIELD,
                json_type_name(other)
            )))
        }
    };

    let first = match inferences.first() {
        None => return Ok(None),
        Some(Value::Object(first)) => first,
        Some(other) => {
            return Err(IngestError::MalformedInput(format!(
                "inference entries must be objects, got {}",
                json_type_name(other)
            )))
        }
    };

    match first.get(OUTPUT_FIELD) {
        None => Ok(Some(String::new())),
        Some(Value::String(encoded)) => Ok(Some(encoded.clone())),
        Some(other) => Err(IngestError::MalformedInput(format!(
            "`{}` must be a string, got {}",
            OUTPUT_FIELD,
            json_type_name(other)
        ))),
    }
}

/// Run the decoder off the async workers; a panic becomes `Internal`
async fn decode_on_blocking_pool(
    decoder: Arc<dyn InferenceDecoder>,
    encoded: String,
) -> Result<Value, IngestError> {
    tokio::task::spawn_blocking(move || decoder.decode(&encoded))
        .await
        .map_err(|e| IngestError::Internal(format!("Decoder task failed: {}", e)))?
        .map_err(IngestError::from)
}

/// Create the directory chain and replace the file contents
///
/// Each level of the chain is created and then canonicalized, so a symlink
/// planted under the root cannot carry the write anywhere else. The target
/// itself must not be a symlink.
async fn write_file(
    kind: IngestKind,
    root: &Path,
    location: &ResolvedLocation,
    contents: &[u8],
) -> Result<(), IngestError> {
    let started = Instant::now();

    create_dir_all(root).await?;
    let canonical_root = canonicalize(root).await?;

    let mut dir = root.to_path_buf();
    for segment in &location.directory_chain {
        dir.push(segment);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(IngestError::Storage { path: dir, source }),
        }
        if !canonicalize(&dir).await?.starts_with(&canonical_root) {
            return Err(PathError::OutsideRoot.into());
        }
    }

    if let Ok(existing) = tokio::fs::symlink_metadata(&location.absolute_path).await {
        if existing.file_type().is_symlink() {
            return Err(PathError::OutsideRoot.into());
        }
    }

    tokio::fs::write(&location.absolute_path, contents)
        .await
        .map_err(|source| IngestError::Storage {
            path: location.absolute_path.clone(),
            source,
        })?;

    metrics::histogram!("receiver.write.duration_seconds", "kind" => kind.as_str())
        .record(started.elapsed().as_secs_f64());

    Ok(())
}

async fn create_dir_all(dir: &Path) -> Result<(), IngestError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| IngestError::Storage {
            path: dir.to_path_buf(),
            source,
        })
}

async fn canonicalize(path: &Path) -> Result<PathBuf, IngestError> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|source| IngestError::Storage {
            path: path.to_path_buf(),
            source,
        })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
