use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use intentflow_types::{IntentflowError, Result};

/// Produces one round of raw candidate text for an intent.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    async fn generate(&self, intent: &str) -> Result<String>;
}

/// Replays recorded generator output, one round per call, cycling.
///
/// A replay file holds rounds separated by lines consisting only of `---`.
pub struct ReplayGenerator {
    rounds: Vec<String>,
    next: AtomicUsize,
}

impl ReplayGenerator {
    pub fn new(rounds: Vec<String>) -> Result<Self> {
        if rounds.is_empty() {
            return Err(IntentflowError::Other(
                "replay generator needs at least one round".into(),
            ));
        }
        Ok(Self {
            rounds,
            next: AtomicUsize::new(0),
        })
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut rounds = Vec::new();
        let mut current = String::new();
        for line in text.lines() {
            if line.trim() == "---" {
                if !current.trim().is_empty() {
                    rounds.push(std::mem::take(&mut current));
                }
                current.clear();
                continue;
            }
            current.push_str(line);
            current.push('\n');
        }
        if !current.trim().is_empty() {
            rounds.push(current);
        }
        Self::new(rounds)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text)
    }

    pub fn rounds(&self) -> usize {
        self.rounds.len()
    }
}

#[async_trait]
impl CandidateGenerator for ReplayGenerator {
    async fn generate(&self, intent: &str) -> Result<String> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.rounds.len();
        tracing::debug!(intent, round = i, "Replaying recorded round");
        Ok(self.rounds[i].clone())
    }
}
