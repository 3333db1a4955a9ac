//! Text Provider
//!
//! Read-only corpus of race passages, partitioned into short and long
//! pools. Loaded once from a JSON file at startup; a built-in corpus is
//! used when the file is missing so the server always comes up.

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Corpus file shape: `{"texts": [...], "longTexts": [...]}`.
#[derive(Debug, Deserialize)]
struct CorpusFile {
    texts: Vec<String>,
    #[serde(rename = "longTexts", default)]
    long_texts: Vec<String>,
}

/// Errors while loading a corpus file.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// File could not be read.
    #[error("failed to read corpus file: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid corpus JSON.
    #[error("failed to parse corpus file: {0}")]
    Parse(#[from] serde_json::Error),

    /// File parsed but contains no passages at all.
    #[error("corpus contains no passages")]
    Empty,
}

/// Provider of random race passages. Read-only after construction.
#[derive(Debug, Clone)]
pub struct TextProvider {
    texts: Vec<String>,
    long_texts: Vec<String>,
}

impl TextProvider {
    /// Load a corpus from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TextError> {
        let raw = std::fs::read_to_string(path)?;
        let corpus: CorpusFile = serde_json::from_str(&raw)?;
        if corpus.texts.is_empty() && corpus.long_texts.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self {
            texts: corpus.texts,
            long_texts: corpus.long_texts,
        })
    }

    /// Load from a file, or fall back to the built-in corpus with a warning.
    pub fn load_or_builtin<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(
                    "Failed to load corpus from {:?}: {}; using built-in passages",
                    path.as_ref(),
                    e
                );
                Self::builtin()
            }
        }
    }

    /// The built-in fallback corpus.
    pub fn builtin() -> Self {
        let texts = [
            "The quick brown fox jumps over the lazy dog while the cat watches from the warm windowsill.",
            "Typing quickly takes practice, patience, and a keyboard that has survived many furious sessions.",
            "A small boat drifted down the river as the morning fog lifted slowly from the quiet water.",
            "Every great program starts with a single line of code and an unreasonable amount of optimism.",
            "The lighthouse keeper climbed the spiral stairs twice a day, in darkness and in dawn light alike.",
        ];
        let long_texts = [
            "It was a bright cold day in April and the clocks were striking thirteen. Far below the streets \
             hummed with traffic, and somewhere a kettle whistled as commuters hurried past shop windows \
             full of things nobody needed but everybody wanted, each of them certain that tomorrow would \
             be quieter than today ever managed to be.",
            "The expedition set out before sunrise, boots crunching over frost that glittered like broken \
             glass. By noon the ridge had narrowed to a spine of bare rock, and the climbers moved one at \
             a time, clipped to a rope that sagged gently between them, saying nothing because the wind \
             said everything that needed saying.",
        ];
        Self {
            texts: texts.iter().map(|s| s.to_string()).collect(),
            long_texts: long_texts.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Pick a random passage from the combined pools.
    pub fn random_passage(&self) -> &str {
        let mut rng = rand::thread_rng();
        let short = self.texts.len();
        let total = short + self.long_texts.len();
        // Constructors guarantee at least one pool is non-empty.
        let idx = rand::Rng::gen_range(&mut rng, 0..total.max(1));
        if idx < short {
            &self.texts[idx]
        } else {
            &self.long_texts[idx - short]
        }
    }

    /// Pick a random short passage, if the pool has any.
    pub fn random_short(&self) -> Option<&str> {
        self.texts.choose(&mut rand::thread_rng()).map(|s| s.as_str())
    }

    /// Pick a random long passage, if the pool has any.
    pub fn random_long(&self) -> Option<&str> {
        self.long_texts
            .choose(&mut rand::thread_rng())
            .map(|s| s.as_str())
    }

    /// Number of passages across both pools.
    pub fn len(&self) -> usize {
        self.texts.len() + self.long_texts.len()
    }

    /// True when both pools are empty. Constructors prevent this.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
