//! Codec dispatch.
//!
//! A codec turns a task-kind-tagged payload into a structured result. Codecs
//! are synchronous and CPU-bound; they only ever run inside an execution
//! unit, never on the async runtime.

pub mod image;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use self::image::{ImageCodec, ImageFormatKind};

/// Stage reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Reading,
    Processing,
    Writing,
    Completed,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Reading => "reading",
            ProgressStage::Processing => "processing",
            ProgressStage::Writing => "writing",
            ProgressStage::Completed => "completed",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress callback handed to [`Codec::execute`].
pub type ProgressFn<'a> = dyn FnMut(ProgressStage, Option<u8>) + 'a;

/// Codec failure. The display text is what ends up in the job's error.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported task kind: {0}")]
    Unsupported(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] ::image::ImageError),

    #[error("{0}")]
    Failed(String),
}

/// A synchronous compression routine for one task kind.
pub trait Codec: Send + Sync {
    /// Task kind this codec handles.
    fn kind(&self) -> &str;

    fn execute(&self, payload: &Value, progress: &mut ProgressFn<'_>) -> Result<Value, CodecError>;
}

/// Codecs keyed by task kind.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in image codecs.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for format in [
            ImageFormatKind::Png,
            ImageFormatKind::Jpeg,
            ImageFormatKind::Webp,
        ] {
            registry.register(Arc::new(ImageCodec::new(format)));
        }
        registry
    }

    /// Register a codec, replacing any codec with the same kind.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.kind().to_string(), codec);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.codecs.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn execute(
        &self,
        kind: &str,
        payload: &Value,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Value, CodecError> {
        let codec = self
            .codecs
            .get(kind)
            .ok_or_else(|| CodecError::Unsupported(kind.to_string()))?;
        codec.execute(payload, progress)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
