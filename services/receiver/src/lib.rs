//! Edge Receiver Service
//!
//! Accepts images and inference-metadata records pushed by edge camera
//! devices over HTTP `PUT`, and persists them to two filesystem trees that
//! mirror the request path.
//!
//! ## Features
//!
//! - **Path-mirrored storage**: `PUT /image/{path}` lands at
//!   `{image_dir}/{path}`; `PUT /meta/{path}` lands at `{meta_dir}/{path}`
//!   with the file name normalized to `.json`
//! - **Inference decoding**: the encoded `O` field of the first inference is
//!   decoded through a pluggable [`InferenceDecoder`] and stored as
//!   `DeserializedData`
//! - **Traversal-safe paths**: `..`, `.`, empty and absolute segments are
//!   refused before anything touches the disk
//! - **Status surface**: counters, uptime and disk usage on `/status`
//!
//! ## Architecture
//!
//! ```text
//!  Device PUT                                          Filesystem
//! ┌──────────────┐    ┌──────────────┐              ┌──────────────┐
//! │ /image/{p}   │───▶│ Ingest       │─────────────▶│ image/{p}    │
//! │ /meta/{p}    │    │ Pipeline     │─────────────▶│ meta/{p}.json│
//! └──────────────┘    └──────────────┘              └──────────────┘
//!                       │    │    │
//!                       ▼    │    ▼
//!              ┌──────────┐  │  ┌──────────────┐
//!              │ Path     │  │  │ Inference    │
//!              │ Resolver │  │  │ Decoder      │
//!              └──────────┘  ▼  └──────────────┘
//!                     ┌──────────────┐     ┌──────────────┐
//!                     │ Stats        │────▶│ /status      │
//!                     │ Registry     │     └──────────────┘
//!                     └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod decoder;
pub mod disk_usage;
pub mod path_resolver;
pub mod pipeline;
pub mod stats;

pub use crate::api::{create_router, start_api_server, AppState, IngestResponse, StatusResponse};
pub use crate::config::Config;
pub use crate::decoder::{Base64BytesDecoder, Base64JsonDecoder, DecodeError, InferenceDecoder};
pub use crate::path_resolver::{IngestKind, PathError, PathResolver, ResolvedLocation};
pub use crate::pipeline::{IngestError, IngestFailure, IngestPipeline, Stored};
pub use crate::stats::{StatsRegistry, StatsSnapshot};
