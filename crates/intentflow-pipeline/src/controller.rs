//! Round controller: the per-intent trial loop.
//!
//! Each trial asks the generator for one round of candidates, drops the
//! blacklisted ones, lets the Thompson sampler pick an arm, scores it, logs
//! the feedback and (in training phases) updates the policy. The first time
//! the consecutive-perfect threshold is reached the chosen candidate is
//! validated, compiled to a workflow manifest and submitted, once.

use std::path::PathBuf;
use std::sync::Arc;

use intentflow_llm::{CandidateGenerator, FeatureBuilder};
use intentflow_plan::{Candidate, CandidateParser};
use intentflow_policy::{LinearThompsonSampler, PolicyParams, PolicyState, PolicyStore};
use intentflow_types::{IntentflowError, Result, RunRecord, TrialResult, Verdict};

use crate::compiler::{CompileOptions, WorkflowCompiler};
use crate::evaluator::Evaluator;
use crate::events::{EventEmitter, RoundEvent};
use crate::graph::TaskGraph;
use crate::ledger::FeedbackLedger;
use crate::metrics::MetricsLog;
use crate::submit::{SubmissionOutcome, Submitter};
use crate::validation::{validate, Severity};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings shared by every intent the controller runs.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// `MAX_T`: trials per intent before giving up.
    pub max_trials: usize,
    pub run_id: String,
    /// Base seed; intent `i` of a controller's lifetime samples with `seed + i`.
    pub seed: Option<u64>,
    pub policy: PolicyParams,
    pub compile: CompileOptions,
    pub submit_namespace: String,
    /// Directory receiving `<intent-slug>-workflow.yaml`.
    pub output_dir: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_trials: 150,
            run_id: "0".to_string(),
            seed: None,
            policy: PolicyParams::default(),
            compile: CompileOptions {
                wait_for_dependencies: false,
                ..CompileOptions::default()
            },
            submit_namespace: "default".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

/// How a phase treats the policy and the success criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConfig {
    pub name: String,
    pub update_policy: bool,
    pub stop_on_success: bool,
    pub success_threshold: usize,
    pub log_posterior: bool,
}

impl PhaseConfig {
    /// Learning phase: the policy is updated and persisted after every trial.
    pub fn train() -> Self {
        Self {
            name: "train".to_string(),
            update_policy: true,
            stop_on_success: true,
            success_threshold: 2,
            log_posterior: true,
        }
    }

    /// Held-out phase: the policy is only read.
    pub fn test() -> Self {
        Self {
            name: "test".to_string(),
            update_policy: false,
            stop_on_success: true,
            success_threshold: 2,
            log_posterior: true,
        }
    }

    /// Intents a phase runs when none are named explicitly: training takes all
    /// but the last two, testing takes the last one.
    pub fn default_intents(&self, all: &[String]) -> Vec<String> {
        if self.update_policy {
            all[..all.len().saturating_sub(2)].to_vec()
        } else {
            all.last().cloned().into_iter().collect()
        }
    }
}

/// Collaborators the controller drives.
pub struct ControllerParts {
    pub parser: Arc<CandidateParser>,
    pub generator: Arc<dyn CandidateGenerator>,
    pub features: FeatureBuilder,
    pub ledger: FeedbackLedger,
    pub policy_store: Arc<dyn PolicyStore>,
    pub compiler: WorkflowCompiler,
    /// `None` writes manifests without submitting them.
    pub submitter: Option<Arc<dyn Submitter>>,
    /// Receives each intent's record as soon as the intent finishes.
    pub metrics: Option<MetricsLog>,
}

// ---------------------------------------------------------------------------
// RoundController
// ---------------------------------------------------------------------------

pub struct RoundController {
    settings: ControllerSettings,
    parser: Arc<CandidateParser>,
    evaluator: Evaluator,
    generator: Arc<dyn CandidateGenerator>,
    features: FeatureBuilder,
    ledger: FeedbackLedger,
    policy_store: Arc<dyn PolicyStore>,
    compiler: WorkflowCompiler,
    submitter: Option<Arc<dyn Submitter>>,
    metrics: Option<MetricsLog>,
    events: EventEmitter,
    intents_run: u64,
}

/// A scored candidate that has not yet been applied to the policy.
struct ScoredTrial {
    candidate: Candidate,
    phi: Vec<f64>,
    verdict: Verdict,
    pipeline_key: String,
}

impl RoundController {
    pub fn new(settings: ControllerSettings, parts: ControllerParts) -> Self {
        Self {
            settings,
            evaluator: Evaluator::new(parts.parser.clone()),
            parser: parts.parser,
            generator: parts.generator,
            features: parts.features,
            ledger: parts.ledger,
            policy_store: parts.policy_store,
            compiler: parts.compiler,
            submitter: parts.submitter,
            metrics: parts.metrics,
            events: EventEmitter::default(),
            intents_run: 0,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn ledger(&self) -> &FeedbackLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Run every intent of a phase in order, one record per intent.
    pub async fn run_phase(&mut self, intents: &[String], phase: &PhaseConfig) -> Result<Vec<RunRecord>> {
        tracing::info!(phase = %phase.name, intents = intents.len(), "Phase started");
        let mut records = Vec::with_capacity(intents.len());
        for intent in intents {
            let record = self.run_intent(intent, phase).await?;
            if let Some(log) = &self.metrics {
                log.append(std::slice::from_ref(&record))?;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Run the trial loop for one intent until success or `max_trials`.
    pub async fn run_intent(&mut self, intent: &str, phase: &PhaseConfig) -> Result<RunRecord> {
        self.parser.catalog().requirements(intent)?;

        let max_trials = self.settings.max_trials;
        let sentinel = max_trials + 1;
        let seed = self.settings.seed.map(|s| s.wrapping_add(self.intents_run));
        self.intents_run += 1;

        let dim = self.features.dim();
        let state = match self.policy_store.load(intent, dim)? {
            Some(state) => state,
            None => PolicyState::fresh(dim, self.settings.policy.lambda),
        };
        let mut sampler = LinearThompsonSampler::from_state(state, self.settings.policy, seed)?;

        self.events.emit(RoundEvent::IntentStarted {
            phase: phase.name.clone(),
            intent: intent.to_string(),
        });
        tracing::info!(phase = %phase.name, intent, max_trials, "Intent started");

        let mut ats = sentinel;
        let mut consecutive = 0usize;
        let mut success_series = Vec::new();
        let mut posterior_series = Vec::new();

        for trial in 1..=max_trials {
            let scored = match self.score_trial(intent, &mut sampler).await {
                Ok(Some(scored)) => scored,
                Ok(None) => {
                    tracing::warn!(intent, trial, "All candidates blacklisted, skipping trial");
                    self.events.emit(RoundEvent::TrialSkipped {
                        intent: intent.to_string(),
                        trial,
                        reason: IntentflowError::EmptyPool.to_string(),
                    });
                    continue;
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    tracing::warn!(intent, trial, error = %e, "Trial skipped");
                    self.events.emit(RoundEvent::TrialSkipped {
                        intent: intent.to_string(),
                        trial,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            // Commit: feedback, then the posterior. Failures here abort the run.
            self.ledger
                .log_feedback(intent, &scored.candidate.text, scored.verdict)?;
            if phase.update_policy {
                sampler.update(&scored.phi, scored.verdict.reward)?;
                self.policy_store.save(intent, sampler.state())?;
            }
            let posterior_norm = sampler.posterior_norm();

            let result = TrialResult {
                trial,
                candidate_id: scored.candidate.id.clone(),
                pipeline_key: scored.pipeline_key.clone(),
                verdict: scored.verdict,
                posterior_norm,
            };
            self.record_trial(intent, &result, &scored.candidate.text);

            success_series.push(u8::from(result.verdict.is_perfect()));
            if phase.log_posterior {
                posterior_series.push(posterior_norm);
            }

            if !result.verdict.is_perfect() {
                consecutive = 0;
                continue;
            }
            consecutive += 1;
            if consecutive >= phase.success_threshold && ats == sentinel {
                ats = trial;
                tracing::info!(intent, trial, "Success threshold reached");
                self.events.emit(RoundEvent::ThresholdReached {
                    intent: intent.to_string(),
                    trial,
                });
                if let Err(e) = self.promote(intent, &scored.candidate.text).await {
                    tracing::error!(intent, error = %e, "Promotion failed");
                }
                if phase.stop_on_success {
                    break;
                }
            }
        }

        let record = RunRecord {
            run_id: self.settings.run_id.clone(),
            phase: phase.name.clone(),
            intent: intent.to_string(),
            ats,
            final_posterior_norm: posterior_series.last().copied().unwrap_or(0.0),
            success_series,
            posterior_norm_series: posterior_series,
        };
        let succeeded = record.succeeded(max_trials);
        tracing::info!(intent, ats, succeeded, "Intent finished");
        self.events.emit(RoundEvent::IntentFinished {
            intent: intent.to_string(),
            ats,
            succeeded,
        });
        Ok(record)
    }

    /// Generate, filter, select and score. Touches no persistent state, so a
    /// failure here leaves the trial as if it never ran.
    async fn score_trial(
        &mut self,
        intent: &str,
        sampler: &mut LinearThompsonSampler,
    ) -> Result<Option<ScoredTrial>> {
        let raw = self.generator.generate(intent).await?;

        let mut pool: Vec<(Candidate, String)> = Vec::new();
        for candidate in self.parser.split(&raw) {
            let key = self.parser.pipeline_key(&candidate.text);
            if self.ledger.is_blacklisted(intent, &key) {
                tracing::debug!(intent, candidate = %candidate.id, key = %key, "Blacklisted candidate dropped");
                continue;
            }
            pool.push((candidate, key));
        }
        if pool.is_empty() {
            return Ok(None);
        }

        let pool_size = pool.len();
        let texts: Vec<&str> = pool.iter().map(|(c, _)| c.text.as_str()).collect();
        let mut phis = self.features.features_for(intent, &texts).await?;

        let chosen = sampler.select_index(&phis)?;
        let phi = phis.swap_remove(chosen);
        let (candidate, pipeline_key) = pool.swap_remove(chosen);
        tracing::debug!(intent, arm = %candidate.id, pool = pool_size, "Arm selected");

        let verdict = self.evaluator.evaluate(intent, &candidate.text)?;
        Ok(Some(ScoredTrial {
            candidate,
            phi,
            verdict,
            pipeline_key,
        }))
    }

    fn record_trial(&self, intent: &str, result: &TrialResult, text: &str) {
        let pipeline = summary_line(text);
        tracing::info!(
            intent,
            trial = result.trial,
            arm = %result.candidate_id,
            reward = result.verdict.reward,
            label = %result.verdict.label,
            posterior_norm = result.posterior_norm,
            pipeline = %pipeline,
            "Trial scored"
        );
        self.events.emit(RoundEvent::TrialCompleted {
            intent: intent.to_string(),
            trial: result.trial,
            reward: result.verdict.reward,
            label: result.verdict.label,
            posterior_norm: result.posterior_norm,
            pipeline,
        });
    }

    /// Validate the winning candidate, write its workflow and hand it to the
    /// submitter. An invalid graph is reported and nothing is written.
    async fn promote(&self, intent: &str, text: &str) -> Result<()> {
        let graph = TaskGraph::from_parsed(&self.parser.parse_to_graph(text));
        let errors: Vec<String> = validate(&graph, &**self.parser.catalog())
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message)
            .collect();
        if !errors.is_empty() {
            tracing::warn!(intent, errors = errors.len(), "Graph rejected, promotion skipped");
            self.events.emit(RoundEvent::PromotionRejected {
                intent: intent.to_string(),
                diagnostics: errors,
            });
            return Ok(());
        }

        let slug = intent_slug(intent);
        let workflow = self.compiler.compile(&slug, &graph, &self.settings.compile)?;
        std::fs::create_dir_all(&self.settings.output_dir)?;
        let path = self.settings.output_dir.join(format!("{slug}-workflow.yaml"));
        workflow.write_to(&path)?;
        tracing::info!(intent, path = %path.display(), tasks = workflow.tasks().len(), "Workflow written");
        self.events.emit(RoundEvent::ManifestWritten {
            intent: intent.to_string(),
            path: path.display().to_string(),
        });

        let outcome = match &self.submitter {
            Some(submitter) => submitter.submit(&path, &self.settings.submit_namespace).await,
            None => SubmissionOutcome::Skipped,
        };
        self.events.emit(RoundEvent::Submission {
            intent: intent.to_string(),
            outcome,
        });
        Ok(())
    }
}

/// Lowercase, spaces to dashes, parentheses dropped, first 20 characters.
pub fn intent_slug(intent: &str) -> String {
    intent
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| *c != '(' && *c != ')')
        .take(20)
        .collect()
}

/// Trimmed non-empty lines joined with ` | `.
pub fn summary_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryCorpus, JsonBlacklistStore};
    use async_trait::async_trait;
    use intentflow_llm::{HashingEmbedder, ReplayGenerator};
    use intentflow_plan::{Catalog, ModuleCatalog};
    use intentflow_policy::{BinaryFileStore, PolicyScope};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    const INTENT: &str =
        "Improve the QoE for user equipment (UEs) while they are moving in the factory";
    const PERFECT: &str =
        "1. UE-Monitor\n1. Wireless-Monitor\n2. LSTM-Predictor\n3. Wireless-Controller";
    const BAD: &str = "1. YOLO\n2. Semantic-Codec";

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(PathBuf, String)>>,
    }

    #[async_trait]
    impl Submitter for Recorder {
        async fn submit(&self, manifest: &Path, namespace: &str) -> SubmissionOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((manifest.to_path_buf(), namespace.to_string()));
            SubmissionOutcome::Submitted {
                stdout: "ok".into(),
            }
        }
    }

    struct Harness {
        controller: RoundController,
        recorder: Arc<Recorder>,
        policy_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(rounds: Vec<&str>, max_trials: usize) -> Harness {
        harness_with(ModuleCatalog::builtin().unwrap(), rounds, max_trials)
    }

    fn harness_with(catalog: ModuleCatalog, rounds: Vec<&str>, max_trials: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(catalog);
        let parser = Arc::new(CandidateParser::new(catalog));
        let ledger = FeedbackLedger::open(
            parser.clone(),
            Arc::new(InMemoryCorpus::new()),
            Arc::new(JsonBlacklistStore::new(dir.path().join("blacklist.json"))),
            dir.path().join("feedback.txt"),
        )
        .unwrap();
        let policy_path = dir.path().join("policy.bin");
        let recorder = Arc::new(Recorder::default());
        let registry: HashMap<String, (String, String)> = HashMap::new();

        let settings = ControllerSettings {
            max_trials,
            seed: Some(7),
            output_dir: dir.path().join("out"),
            ..ControllerSettings::default()
        };
        let parts = ControllerParts {
            parser,
            generator: Arc::new(
                ReplayGenerator::new(rounds.into_iter().map(String::from).collect()).unwrap(),
            ),
            features: FeatureBuilder::new(Arc::new(HashingEmbedder::new(8)), 64),
            ledger,
            policy_store: Arc::new(BinaryFileStore::new(&policy_path, PolicyScope::Shared)),
            compiler: WorkflowCompiler::new(Arc::new(registry)),
            submitter: Some(recorder.clone()),
            metrics: None,
        };
        Harness {
            controller: RoundController::new(settings, parts),
            recorder,
            policy_path,
            _dir: dir,
        }
    }

    #[test]
    fn slug_matches_manifest_naming() {
        assert_eq!(intent_slug(INTENT), "improve-the-qoe-for-");
        assert_eq!(intent_slug("Detect (fast)"), "detect-fast");
    }

    #[test]
    fn summary_joins_trimmed_lines() {
        assert_eq!(summary_line("  1. A\n\n 2. B  \n"), "1. A | 2. B");
    }

    #[test]
    fn default_phase_intents() {
        let all: Vec<String> = (1..=6).map(|i| format!("i{i}")).collect();
        assert_eq!(PhaseConfig::train().default_intents(&all), all[..4].to_vec());
        assert_eq!(PhaseConfig::test().default_intents(&all), vec!["i6".to_string()]);
        assert!(PhaseConfig::train().default_intents(&all[..1]).is_empty());
    }

    #[tokio::test]
    async fn two_perfect_trials_promote_once_and_stop() {
        let mut h = harness(vec![PERFECT], 10);
        let record = h.controller.run_intent(INTENT, &PhaseConfig::train()).await.unwrap();

        assert_eq!(record.ats, 2);
        assert_eq!(record.success_series, vec![1, 1]);
        assert_eq!(record.posterior_norm_series.len(), 2);
        assert_eq!(record.final_posterior_norm, record.posterior_norm_series[1]);

        let calls = h.recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "default");
        assert!(calls[0].0.ends_with("improve-the-qoe-for--workflow.yaml"));
        assert!(calls[0].0.exists());
        assert!(h.policy_path.exists());
    }

    #[tokio::test]
    async fn bad_trial_resets_counter_and_blacklists() {
        let mut h = harness(vec![PERFECT, BAD, PERFECT, PERFECT], 10);
        let record = h.controller.run_intent(INTENT, &PhaseConfig::train()).await.unwrap();

        assert_eq!(record.success_series, vec![1, 0, 1, 1]);
        assert_eq!(record.ats, 4);
        assert!(h
            .controller
            .ledger()
            .is_blacklisted(INTENT, "YOLO > Semantic-Codec"));
    }

    #[tokio::test]
    async fn blacklisted_only_round_is_skipped_without_reset() {
        let mut h = harness(vec![BAD, PERFECT, BAD, PERFECT], 10);
        let mut rx = h.controller.events().subscribe();
        let record = h.controller.run_intent(INTENT, &PhaseConfig::train()).await.unwrap();

        // Trial 3 replays the blacklisted pipeline and is skipped; trial 4
        // continues the streak started at trial 2.
        assert_eq!(record.success_series, vec![0, 1, 1]);
        assert_eq!(record.ats, 4);

        let mut skipped = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RoundEvent::TrialSkipped { trial, .. } = event {
                skipped.push(trial);
            }
        }
        assert_eq!(skipped, vec![3]);
    }

    #[tokio::test]
    async fn exhaustion_leaves_sentinel() {
        let mut h = harness(vec![PERFECT, BAD], 3);
        let record = h.controller.run_intent(INTENT, &PhaseConfig::test()).await.unwrap();
        assert_eq!(record.ats, 4);
        assert!(!record.succeeded(3));
        assert!(h.recorder.calls.lock().unwrap().is_empty());
        // Test phase never persists the policy.
        assert!(!h.policy_path.exists());
    }

    #[tokio::test]
    async fn unknown_intent_is_terminal() {
        let mut h = harness(vec![PERFECT], 3);
        let err = h
            .controller
            .run_intent("fly to the moon", &PhaseConfig::train())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn invalid_graph_is_not_promoted() {
        // Scores perfect (LSTM-Predictor is optional here) but LSTM-Predictor
        // lacks the Wireless-Monitor predecessor this catalog demands.
        let intent = "Enable drones to perform on-board model detection and minimize bandwidth usage when transmitting the resulting JSON files to the MEC.";
        let text = "1. UE-Monitor\n2. YOLO\n3. Semantic-Codec\n4. LSTM-Predictor\n5. Wireless-Controller";
        let mut catalog = Catalog::builtin().unwrap();
        for module in &mut catalog.modules {
            if module.name == "LSTM-Predictor" {
                module.requires = vec!["Wireless-Monitor".into()];
            }
        }
        let mut h = harness_with(ModuleCatalog::new(catalog).unwrap(), vec![text], 5);
        let mut rx = h.controller.events().subscribe();
        let record = h.controller.run_intent(intent, &PhaseConfig::train()).await.unwrap();

        assert_eq!(record.ats, 2);
        assert!(h.recorder.calls.lock().unwrap().is_empty());

        let mut rejected = None;
        let mut written = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                RoundEvent::PromotionRejected { diagnostics, .. } => rejected = Some(diagnostics),
                RoundEvent::ManifestWritten { .. } => written = true,
                _ => {}
            }
        }
        let diagnostics = rejected.expect("promotion rejected");
        assert!(diagnostics.iter().any(|m| m.contains("Wireless-Monitor")));
        assert!(!written);
    }
}
