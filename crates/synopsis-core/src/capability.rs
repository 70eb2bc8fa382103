//! Capability traits consumed by the summarization pipeline.
//!
//! Each stage of the pipeline talks to one of these traits. Concrete
//! implementations (the built-in text processors, or wrappers around a
//! real model server) live in the `synopsis` app crate and are injected at
//! startup, so tests can substitute fakes for any stage.
//!
//! All methods are async: model inference and encoding can take seconds,
//! and the runner must yield while it waits.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::TextChunk;
use crate::models::{DetectedLanguage, Params};

/// Model-ready representation of a preprocessed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedText {
    pub chunks: Vec<TextChunk>,
}

impl EncodedText {
    /// Total length of all chunk texts, in characters.
    pub fn char_len(&self) -> usize {
        self.chunks.iter().map(|c| c.text.chars().count()).sum()
    }
}

/// Normalizes a raw source. The output determines the summary identity,
/// so implementations must be deterministic and idempotent.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn preprocess(&self, text: &str) -> Result<String>;
}

/// Turns preprocessed text into the summarizer's input, splitting long
/// texts as needed.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<EncodedText>;
}

/// Produces raw model output from an encoded source.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, encoded: &EncodedText, params: &Params) -> Result<String>;
}

/// Cleans and reassembles raw model output into final text.
#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn postprocess(&self, text: &str) -> Result<String>;
}

/// Identifies the main language of a text.
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<DetectedLanguage>;
}
