use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::capability::{LiteratureIndex, PiiRedaction, TextGeneration};
use crate::config::{PipelineConfig, RedactionPolicy};
use crate::error::PipelineError;
use crate::event::{DoneSummary, ErrorScope, ProgressEvent, ProgressStream};
use crate::extract::{FeatureExtractor, parser_for};
use crate::model::{AnalyzedArticle, Case};
use crate::retrieve::{ArticleRetriever, RetrievalRequest};
use crate::stage::{PipelineState, Stage};
use crate::synthesize::AnalysisSynthesizer;

/// Input of one end-to-end case analysis.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRequest {
    pub case_text: String,
    #[serde(default)]
    pub event_prompt: Option<String>,
    #[serde(default, alias = "methodologyContent")]
    pub methodology: Option<String>,
    #[serde(default)]
    pub num_articles: Option<usize>,
}

impl CaseRequest {
    pub fn new(case_text: impl Into<String>) -> Self {
        Self {
            case_text: case_text.into(),
            event_prompt: None,
            methodology: None,
            num_articles: None,
        }
    }
}

/// The pipeline stages wired to one set of capability clients.
#[derive(Clone)]
pub struct PipelineComponents {
    pub redactor: Arc<dyn PiiRedaction>,
    pub extractor: FeatureExtractor,
    pub retriever: ArticleRetriever,
    pub synthesizer: AnalysisSynthesizer,
    pub config: Arc<PipelineConfig>,
}

impl PipelineComponents {
    pub fn new(
        generator: Arc<dyn TextGeneration>,
        index: Arc<dyn LiteratureIndex>,
        redactor: Arc<dyn PiiRedaction>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let synthesizer = AnalysisSynthesizer::new(generator.clone());
        Self {
            redactor,
            extractor: FeatureExtractor::new(generator, parser_for(config.event_format)),
            retriever: ArticleRetriever::new(index, synthesizer.clone(), config.clone()),
            synthesizer,
            config,
        }
    }
}

enum Halt {
    Disconnected,
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        Halt::Failed(err)
    }
}

type Step<T> = std::result::Result<T, Halt>;

/// Runs redaction, extraction, retrieval and synthesis for one case and multiplexes
/// their progress onto a single stream.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    components: PipelineComponents,
}

impl PipelineOrchestrator {
    pub fn new(components: PipelineComponents) -> Self {
        Self { components }
    }

    /// Starts the pipeline. The returned stream ends with exactly one terminal event:
    /// `done` carrying the final analysis, or a stream-scoped `error` naming the
    /// failed stage. Dropping the stream cancels the request.
    pub fn run(&self, request: CaseRequest) -> ProgressStream {
        let (tx, stream) = ProgressStream::channel(self.components.config.channel_capacity);
        let request_id = Uuid::new_v4();
        let span = info_span!("case_analysis", %request_id);
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive(request, tx).await }.instrument(span));
        stream
    }

    async fn drive(self, request: CaseRequest, tx: mpsc::Sender<ProgressEvent>) {
        let mut state = PipelineState::new();
        // Dropping `execute` cancels whichever capability call is in flight.
        let outcome = tokio::select! {
            outcome = self.execute(&request, &mut state, &tx) => outcome,
            _ = tx.closed() => Err(Halt::Disconnected),
        };
        match outcome {
            Ok(summary) => {
                info!(
                    analyzed = summary.articles_analyzed,
                    failed = summary.articles_failed,
                    timed_out = summary.timed_out,
                    "Case analysis completed"
                );
                let _ = tx.send(ProgressEvent::Done(summary)).await;
            }
            Err(Halt::Disconnected) => {
                debug!(?state, "Caller disconnected, pipeline abandoned");
            }
            Err(Halt::Failed(err)) => {
                let stage = state.stage().unwrap_or(Stage::Received);
                if let Err(e) = state.fail() {
                    error!(error = %e, "Pipeline failed after reaching a terminal state");
                }
                let err = err.at_stage(stage);
                error!(%stage, error = %err, "Case analysis failed");
                let _ = tx.send(ProgressEvent::fatal(stage, &err)).await;
            }
        }
    }

    async fn execute(
        &self,
        request: &CaseRequest,
        state: &mut PipelineState,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> Step<DoneSummary> {
        let components = &self.components;

        if request.case_text.trim().is_empty() {
            return Err(PipelineError::validation("case text is required").into());
        }
        if request.num_articles == Some(0) {
            return Err(PipelineError::validation("numArticles must be at least 1").into());
        }
        let case = Case::new(request.case_text.clone());

        let case = {
            self.transition(state, tx, "Redacting personal information").await?;
            match components.redactor.redact(case.raw_text()).await {
                Ok(redacted) => case.with_redacted(redacted),
                Err(e) if components.config.redaction == RedactionPolicy::BestEffort => {
                    warn!(error = %e, "Redaction failed, continuing with unredacted text");
                    case
                }
                Err(e) => return Err(PipelineError::from(e).into()),
            }
        };

        let case = {
            self.transition(state, tx, "Extracting disease and clinical events").await?;
            let text = case.working_text();
            let (disease, events) = tokio::try_join!(
                components.extractor.extract_disease(text),
                components
                    .extractor
                    .extract_events(text, request.event_prompt.as_deref()),
            )?;
            case.with_features(disease, events)
        };

        self.transition(state, tx, "Retrieving and analyzing literature").await?;
        let disease = case.disease().unwrap_or_default();
        let retrieval = RetrievalRequest {
            disease: disease.to_string(),
            events: case.events().to_vec(),
            methodology: request.methodology.clone(),
            num_articles: components.config.num_articles(request.num_articles),
        };
        let (articles, mut summary) = self.forward_retrieval(retrieval, tx).await?;

        self.transition(state, tx, "Synthesizing final analysis").await?;
        let analysis = components
            .synthesizer
            .synthesize_final(case.working_text(), disease, case.events(), &articles)
            .await?;

        if let Err(e) = state.advance() {
            error!(error = %e, "Could not complete pipeline");
        }
        summary.analysis = Some(analysis);
        Ok(summary)
    }

    /// Advances the state machine and announces the new stage.
    async fn transition(
        &self,
        state: &mut PipelineState,
        tx: &mpsc::Sender<ProgressEvent>,
        message: &str,
    ) -> Step<()> {
        let next = state
            .advance()
            .map_err(|e| Halt::Failed(PipelineError::validation(e.to_string())))?;
        if let PipelineState::Active(stage) = next {
            info!(%stage, "Pipeline stage started");
            send(tx, ProgressEvent::status(stage, message)).await?;
        }
        Ok(())
    }

    /// Relays retrieval progress and collects the analyzed articles.
    ///
    /// The retriever's own `done` is consumed here; the orchestrator emits the only
    /// terminal event of the request.
    async fn forward_retrieval(
        &self,
        request: RetrievalRequest,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> Step<(Vec<AnalyzedArticle>, DoneSummary)> {
        let mut stream = self.components.retriever.retrieve(request);
        let mut articles = Vec::new();

        while let Some(event) = stream.recv().await {
            match event {
                ProgressEvent::Done(summary) => return Ok((articles, summary)),
                ProgressEvent::Error(report) if report.scope == ErrorScope::Stream => {
                    return Err(PipelineError::PipelineFailed {
                        stage: Stage::Retrieving,
                        cause: report.message,
                    }
                    .into());
                }
                ProgressEvent::Article(article) => {
                    articles.push(article.clone());
                    send(tx, ProgressEvent::Article(article)).await?;
                }
                other => send(tx, other).await?,
            }
        }

        Err(PipelineError::PipelineFailed {
            stage: Stage::Retrieving,
            cause: "retrieval ended without a terminal event".to_string(),
        }
        .into())
    }
}

async fn send(tx: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) -> Step<()> {
    tx.send(event).await.map_err(|_| Halt::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{ScriptedGenerator, StubIndex, StubRedactor, hit};
    use std::time::Duration;

    const ASSESSMENT: &str = r#"{"relevance_summary": "Relevant", "evidence": ["OS benefit"]}"#;

    fn hits() -> Vec<crate::model::SearchHit> {
        (0..15)
            .map(|i| hit(&format!("{}", 200 + i), 0.9 - i as f64 * 0.01, 0.4))
            .collect()
    }

    fn happy_generator() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .reply("Disease:", "Diffuse midline glioma")
            .reply("Events", r#"["H3K27M mutation", "Radiotherapy completed"]"#)
            .reply("Article PMID", ASSESSMENT)
            .reply(
                "Recommendation:",
                "Consider ONC201 [PMID:200] with re-irradiation [PMID:201] [PMID:202].",
            )
    }

    fn orchestrator(
        generator: ScriptedGenerator,
        redactor: StubRedactor,
        config: PipelineConfig,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(PipelineComponents::new(
            Arc::new(generator),
            Arc::new(StubIndex::new(hits())),
            Arc::new(redactor),
            Arc::new(config),
        ))
    }

    fn assert_single_terminal_last(events: &[ProgressEvent]) {
        let terminal: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminal, vec![events.len() - 1], "events: {events:?}");
    }

    fn failed_stage(events: &[ProgressEvent]) -> Option<(Stage, ErrorKind)> {
        match events.last() {
            Some(ProgressEvent::Error(report)) if report.scope == ErrorScope::Stream => {
                report.stage.map(|stage| (stage, report.kind))
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn completes_with_final_analysis() {
        let orchestrator = orchestrator(happy_generator(), StubRedactor::new(), PipelineConfig::default());
        let mut request = CaseRequest::new("Jane Doe, 8y, DIPG diagnosed 2023");
        request.num_articles = Some(3);
        let events = orchestrator.run(request).collect_all().await;

        assert_single_terminal_last(&events);
        let stages: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Status(s) if s.article_id.is_none() => s.stage,
                _ => None,
            })
            .collect();
        assert_eq!(
            &stages[..3],
            &[Stage::Redacting, Stage::Extracting, Stage::Retrieving]
        );
        assert_eq!(stages.last(), Some(&Stage::Synthesizing));

        match events.last() {
            Some(ProgressEvent::Done(summary)) => {
                assert_eq!(summary.articles_analyzed, 3);
                let analysis = summary.analysis.as_ref().unwrap();
                assert_eq!(analysis.citations, vec!["200", "201", "202"]);
            }
            other => panic!("unexpected terminal {other:?}"),
        }
        let article_count = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Article(_)))
            .count();
        assert_eq!(article_count, 3);
    }

    #[tokio::test]
    async fn synthesis_failure_is_terminal_pipeline_failure() {
        let generator = ScriptedGenerator::new()
            .reply("Disease:", "Osteosarcoma")
            .reply("Events", "[]")
            .reply("Article PMID", ASSESSMENT)
            .fail_on("Recommendation:");
        let orchestrator = orchestrator(generator, StubRedactor::new(), PipelineConfig::default());
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;

        assert_single_terminal_last(&events);
        assert_eq!(
            failed_stage(&events),
            Some((Stage::Synthesizing, ErrorKind::PipelineFailed))
        );
        assert!(!events.iter().any(|e| matches!(
            e,
            ProgressEvent::Done(DoneSummary { analysis: Some(_), .. })
        )));
    }

    #[tokio::test]
    async fn blank_disease_fails_extraction() {
        let generator = ScriptedGenerator::new()
            .reply("Disease:", "  ")
            .reply("Events", r#"["fever"]"#);
        let orchestrator = orchestrator(generator, StubRedactor::new(), PipelineConfig::default());
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;
        assert_single_terminal_last(&events);
        assert_eq!(
            failed_stage(&events),
            Some((Stage::Extracting, ErrorKind::PipelineFailed))
        );
        assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Article(_))));
    }

    #[tokio::test]
    async fn empty_events_still_retrieve() {
        let generator = ScriptedGenerator::new()
            .reply("Events", "[]")
            .reply("Disease:", "Wilms tumor")
            .reply("Article PMID", ASSESSMENT)
            .reply("Recommendation:", "Standard regimen [PMID:200].");
        let orchestrator = orchestrator(generator, StubRedactor::new(), PipelineConfig::default());
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;
        assert!(matches!(events.last(), Some(ProgressEvent::Done(_))));
    }

    #[tokio::test]
    async fn redaction_failure_is_fatal_by_default() {
        let orchestrator = orchestrator(happy_generator(), StubRedactor::failing(), PipelineConfig::default());
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;
        assert_single_terminal_last(&events);
        assert_eq!(
            failed_stage(&events),
            Some((Stage::Redacting, ErrorKind::PipelineFailed))
        );
    }

    #[tokio::test]
    async fn best_effort_redaction_continues() {
        let mut config = PipelineConfig::default();
        config.redaction = RedactionPolicy::BestEffort;
        let orchestrator = orchestrator(happy_generator(), StubRedactor::failing(), config);
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;
        assert_single_terminal_last(&events);
        assert!(matches!(events.last(), Some(ProgressEvent::Done(_))));
    }

    #[tokio::test]
    async fn empty_case_text_is_rejected() {
        let orchestrator = orchestrator(happy_generator(), StubRedactor::new(), PipelineConfig::default());
        let events = orchestrator.run(CaseRequest::new("   ")).collect_all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            failed_stage(&events),
            Some((Stage::Received, ErrorKind::ValidationError))
        );
    }

    #[tokio::test]
    async fn search_failure_fails_retrieving_stage() {
        let orchestrator = PipelineOrchestrator::new(PipelineComponents::new(
            Arc::new(happy_generator()),
            Arc::new(StubIndex::failing()),
            Arc::new(StubRedactor::new()),
            Arc::new(PipelineConfig::default()),
        ));
        let events = orchestrator.run(CaseRequest::new("notes")).collect_all().await;
        assert_single_terminal_last(&events);
        assert_eq!(
            failed_stage(&events),
            Some((Stage::Retrieving, ErrorKind::PipelineFailed))
        );
    }

    #[tokio::test]
    async fn every_request_reaches_exactly_one_terminal_state() {
        let scenarios: Vec<(ScriptedGenerator, StubRedactor)> = vec![
            (happy_generator(), StubRedactor::new()),
            (happy_generator(), StubRedactor::failing()),
            (
                ScriptedGenerator::new().fail_on("Disease:").reply("Events", "[]"),
                StubRedactor::new(),
            ),
            (
                ScriptedGenerator::new()
                    .reply("Disease:", "ALL")
                    .reply("Events", "[]")
                    .fail_on("Article PMID"),
                StubRedactor::new(),
            ),
        ];
        for (generator, redactor) in scenarios {
            let orchestrator = orchestrator(generator, redactor, PipelineConfig::default());
            let events = orchestrator
                .run(CaseRequest::new("A non-empty case"))
                .collect_all()
                .await;
            assert_single_terminal_last(&events);
        }
    }

    fn is_stage_status(event: &ProgressEvent, stage: Stage) -> bool {
        matches!(event, ProgressEvent::Status(s) if s.article_id.is_none() && s.stage == Some(stage))
    }

    #[tokio::test(start_paused = true)]
    async fn retrieval_deadline_still_synthesizes_collected_articles() {
        let generator = happy_generator().delay_on("Article PMID 202:", Duration::from_secs(600));
        let mut config = PipelineConfig::default();
        config.retrieval_deadline_secs = 30;
        config.max_concurrency = Some(1);
        let orchestrator = orchestrator(generator, StubRedactor::new(), config);
        let mut request = CaseRequest::new("notes");
        request.num_articles = Some(4);
        let events = orchestrator.run(request).collect_all().await;

        assert_single_terminal_last(&events);
        assert!(events.iter().any(|e| is_stage_status(e, Stage::Synthesizing)));
        match events.last() {
            Some(ProgressEvent::Done(summary)) => {
                assert!(summary.timed_out);
                assert_eq!(summary.articles_analyzed, 2);
                let analysis = summary.analysis.as_ref().unwrap();
                assert_eq!(analysis.citations, vec!["200", "201"]);
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_synthesis_cancels_the_call() {
        let generator = happy_generator().delay_on("Recommendation:", Duration::from_secs(60));
        let orchestrator = orchestrator(generator.clone(), StubRedactor::new(), PipelineConfig::default());
        let mut stream = orchestrator.run(CaseRequest::new("notes"));
        while let Some(event) = stream.recv().await {
            if is_stage_status(&event, Stage::Synthesizing) {
                break;
            }
        }
        let before = generator.completed_calls();
        drop(stream);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(generator.completed_calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_extraction_cancels_both_calls() {
        let generator = happy_generator()
            .delay_on("Disease:", Duration::from_secs(60))
            .delay_on("Events", Duration::from_secs(60));
        let orchestrator = orchestrator(generator.clone(), StubRedactor::new(), PipelineConfig::default());
        let mut stream = orchestrator.run(CaseRequest::new("notes"));
        while let Some(event) = stream.recv().await {
            if is_stage_status(&event, Stage::Extracting) {
                break;
            }
        }
        drop(stream);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(generator.completed_calls(), 0);
    }
}
