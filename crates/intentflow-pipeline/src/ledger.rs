//! Feedback ledger: outcome narratives, the feedback corpus and the blacklist.
//!
//! Every scored trial becomes a one-sentence narrative that is added to the
//! corpus (where the generator's prompt builder reads it back) and appended
//! to a plain-text transcript. Bad outcomes additionally blacklist the
//! candidate's PipelineKey for that intent; the blacklist is rewritten in
//! full after each change.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use intentflow_plan::CandidateParser;
use intentflow_types::{IntentflowError, Label, Result, Verdict};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Background material loaded once; survives a reset.
    Core,
    Feedback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl CorpusDocument {
    pub fn feedback(text: String, intent: &str, verdict: Verdict) -> Self {
        Self {
            text,
            metadata: DocumentMetadata {
                kind: DocumentKind::Feedback,
                label: Some(verdict.label),
                reward: Some(verdict.reward),
                intent: Some(intent.to_string()),
            },
        }
    }

    pub fn core(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: DocumentMetadata {
                kind: DocumentKind::Core,
                label: None,
                reward: None,
                intent: None,
            },
        }
    }

    fn is_feedback_for(&self, intent: &str) -> bool {
        self.metadata.kind == DocumentKind::Feedback
            && self.metadata.intent.as_deref() == Some(intent)
    }
}

// ---------------------------------------------------------------------------
// FeedbackCorpus
// ---------------------------------------------------------------------------

/// Document store holding feedback narratives next to core documents.
pub trait FeedbackCorpus: Send + Sync {
    fn add(&self, doc: CorpusDocument) -> Result<()>;

    /// Up to `limit` most recent feedback documents for `intent`, oldest first.
    fn recent_feedback(&self, intent: &str, limit: usize) -> Result<Vec<CorpusDocument>>;

    /// Remove every feedback document; returns how many were removed.
    fn purge_feedback(&self) -> Result<usize>;
}

fn last_n<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    let skip = items.len().saturating_sub(limit);
    items.drain(..skip);
    items
}

#[derive(Default)]
pub struct InMemoryCorpus {
    docs: Mutex<Vec<CorpusDocument>>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<CorpusDocument> {
        self.docs.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> IntentflowError {
    IntentflowError::Other("corpus lock poisoned".into())
}

impl FeedbackCorpus for InMemoryCorpus {
    fn add(&self, doc: CorpusDocument) -> Result<()> {
        self.docs.lock().map_err(poisoned)?.push(doc);
        Ok(())
    }

    fn recent_feedback(&self, intent: &str, limit: usize) -> Result<Vec<CorpusDocument>> {
        let docs = self.docs.lock().map_err(poisoned)?;
        let matching = docs
            .iter()
            .filter(|d| d.is_feedback_for(intent))
            .cloned()
            .collect();
        Ok(last_n(matching, limit))
    }

    fn purge_feedback(&self) -> Result<usize> {
        let mut docs = self.docs.lock().map_err(poisoned)?;
        let before = docs.len();
        docs.retain(|d| d.metadata.kind != DocumentKind::Feedback);
        Ok(before - docs.len())
    }
}

/// One JSON document per line.
pub struct JsonlCorpus {
    path: PathBuf,
}

impl JsonlCorpus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<CorpusDocument>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut docs = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(doc) => docs.push(doc),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable corpus line"
                ),
            }
        }
        Ok(docs)
    }
}

impl FeedbackCorpus for JsonlCorpus {
    fn add(&self, doc: CorpusDocument) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&doc)?)?;
        Ok(())
    }

    fn recent_feedback(&self, intent: &str, limit: usize) -> Result<Vec<CorpusDocument>> {
        let matching = self
            .read_all()?
            .into_iter()
            .filter(|d| d.is_feedback_for(intent))
            .collect();
        Ok(last_n(matching, limit))
    }

    fn purge_feedback(&self) -> Result<usize> {
        let docs = self.read_all()?;
        let before = docs.len();
        let kept: Vec<_> = docs
            .into_iter()
            .filter(|d| d.metadata.kind != DocumentKind::Feedback)
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut body = String::new();
        for doc in &kept {
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }
        write_atomic(&self.path, body.as_bytes())?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Blacklist
// ---------------------------------------------------------------------------

/// Intent → rejected PipelineKeys, in rejection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blacklist(BTreeMap<String, Vec<String>>);

impl Blacklist {
    pub fn contains(&self, intent: &str, key: &str) -> bool {
        self.0
            .get(intent)
            .is_some_and(|keys| keys.iter().any(|k| k == key))
    }

    /// Returns `false` when the key was already blacklisted.
    pub fn insert(&mut self, intent: &str, key: String) -> bool {
        let keys = self.0.entry(intent.to_string()).or_default();
        if keys.contains(&key) {
            return false;
        }
        keys.push(key);
        true
    }

    pub fn keys_for(&self, intent: &str) -> &[String] {
        self.0.get(intent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of blacklisted keys across intents.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait BlacklistStore: Send + Sync {
    fn load(&self) -> Result<Blacklist>;
    fn save(&self, blacklist: &Blacklist) -> Result<()>;
    /// Delete persisted state; `true` if anything was removed.
    fn clear(&self) -> Result<bool>;
}

/// Pretty-printed JSON object `{intent: [key, ...]}`.
pub struct JsonBlacklistStore {
    path: PathBuf,
}

impl JsonBlacklistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlacklistStore for JsonBlacklistStore {
    fn load(&self) -> Result<Blacklist> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Blacklist::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(bl) => Ok(bl),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Blacklist is unreadable, starting empty"
                );
                Ok(Blacklist::default())
            }
        }
    }

    fn save(&self, blacklist: &Blacklist) -> Result<()> {
        let json = serde_json::to_string_pretty(blacklist)?;
        write_atomic(&self.path, json.as_bytes())
    }

    fn clear(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}

// ---------------------------------------------------------------------------
// FeedbackLedger
// ---------------------------------------------------------------------------

pub struct FeedbackLedger {
    parser: Arc<CandidateParser>,
    corpus: Arc<dyn FeedbackCorpus>,
    store: Arc<dyn BlacklistStore>,
    blacklist: Blacklist,
    transcript: PathBuf,
}

impl FeedbackLedger {
    /// Loads the current blacklist from `store`.
    pub fn open(
        parser: Arc<CandidateParser>,
        corpus: Arc<dyn FeedbackCorpus>,
        store: Arc<dyn BlacklistStore>,
        transcript: impl Into<PathBuf>,
    ) -> Result<Self> {
        let blacklist = store.load()?;
        tracing::debug!(entries = blacklist.len(), "Blacklist loaded");
        Ok(Self {
            parser,
            corpus,
            store,
            blacklist,
            transcript: transcript.into(),
        })
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn corpus(&self) -> &Arc<dyn FeedbackCorpus> {
        &self.corpus
    }

    pub fn is_blacklisted(&self, intent: &str, pipeline_key: &str) -> bool {
        self.blacklist.contains(intent, pipeline_key)
    }

    /// Record one scored trial. Returns the narrative that was stored.
    pub fn log_feedback(&mut self, intent: &str, pipeline_text: &str, verdict: Verdict) -> Result<String> {
        let text = render_feedback(intent, pipeline_text, verdict.label);

        self.corpus
            .add(CorpusDocument::feedback(text.clone(), intent, verdict))?;

        ensure_parent(&self.transcript)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.transcript)?;
        writeln!(file, "{text}")?;

        if verdict.label == Label::Bad {
            let key = self.parser.pipeline_key(pipeline_text);
            if self.blacklist.insert(intent, key.clone()) {
                self.store.save(&self.blacklist)?;
                tracing::info!(intent, key = %key, "Pipeline blacklisted");
            }
        }
        Ok(text)
    }

    pub fn purge_feedback(&self) -> Result<usize> {
        self.corpus.purge_feedback()
    }
}

/// Human-readable outcome sentence for one trial.
pub fn render_feedback(intent: &str, pipeline_text: &str, label: Label) -> String {
    let (nice, tail) = match label {
        Label::Perfect => (
            "perfect",
            "choose this one if you meet this intent again in the future",
        ),
        Label::Partial => (
            "Partial",
            "works but can be better; try to remove the unnecessary modules next time",
        ),
        Label::Bad => ("Bad", "never choose this combination again for this intent"),
    };
    format!(
        "To satisfy '{intent}', we tested the pipeline '{}', and the result is {nice}, {tail}.",
        one_line(pipeline_text)
    )
}

/// Non-empty trimmed lines joined as `a, b, and c`.
pub fn one_line(pipeline_text: &str) -> String {
    let steps: Vec<&str> = pipeline_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    match steps.split_last() {
        None => String::new(),
        Some((last, [])) => (*last).to_string(),
        Some((last, rest)) => format!("{}, and {last}", rest.join(", ")),
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
