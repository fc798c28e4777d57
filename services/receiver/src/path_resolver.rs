use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Which storage tree a request lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestKind {
    Image,
    Metadata,
}

impl IngestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestKind::Image => "image",
            IngestKind::Metadata => "meta",
        }
    }
}

/// Reasons a request path is refused
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("Request path is empty")]
    Empty,

    #[error("Empty segment at position {0}")]
    EmptySegment(usize),

    #[error("Forbidden segment {0:?}")]
    ForbiddenSegment(String),

    #[error("Resolved path escapes the storage root")]
    OutsideRoot,
}

/// On-disk destination for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    /// All but the last segment of the request path
    pub directory_chain: Vec<String>,
    /// Last segment, normalized for metadata
    pub file_name: String,
    /// Root joined with the chain and the file name
    pub absolute_path: PathBuf,
}

/// Maps slash-delimited request paths under a single storage root
///
/// Layout: `{root}/{seg0}/.../{segN-1}/{file_name}`. The request path is the
/// only routing input; device IDs inside payloads are never consulted.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    kind: IngestKind,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>, kind: IngestKind) -> Self {
        Self {
            root: root.into(),
            kind,
        }
    }

    /// Storage root every resolved path lies under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a raw request path to its destination under the root
    pub fn resolve(&self, raw_path: &str) -> Result<ResolvedLocation, PathError> {
        if raw_path.is_empty() {
            return Err(PathError::Empty);
        }

        let mut segments = Vec::new();
        for (index, segment) in raw_path.split('/').enumerate() {
            validate_segment(index, segment)?;
            segments.push(segment.to_string());
        }

        // split always yields at least one item
        let last = segments.pop().ok_or(PathError::Empty)?;
        let file_name = match self.kind {
            IngestKind::Image => last,
            IngestKind::Metadata => normalize_meta_file_name(&last),
        };

        let mut absolute_path = self.root.clone();
        for dir in &segments {
            absolute_path.push(dir);
        }
        absolute_path.push(&file_name);

        if !absolute_path.starts_with(&self.root) {
            return Err(PathError::OutsideRoot);
        }

        Ok(ResolvedLocation {
            directory_chain: segments,
            file_name,
            absolute_path,
        })
    }
}

/// A segment must be exactly one normal path component
fn validate_segment(index: usize, segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(index));
    }
    if segment.contains('\\') || segment.contains('\0') {
        return Err(PathError::ForbiddenSegment(segment.to_string()));
    }

    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(PathError::ForbiddenSegment(segment.to_string())),
    }
}

/// `.txt` becomes `.json`, anything else without `.json` gets it appended
pub fn normalize_meta_file_name(name: &str) -> String {
    if let Some(stem) = name.strip_suffix(".txt") {
        format!("{}.json", stem)
    } else if name.ends_with(".json") {
        name.to_string()
    } else {
        format!("{}.json", name)
    }
}
