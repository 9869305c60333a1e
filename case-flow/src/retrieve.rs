use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::capability::LiteratureIndex;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::event::{DoneSummary, ProgressEvent, ProgressStream};
use crate::model::{AnalyzedArticle, ArticleCandidate};
use crate::rank::rank_candidates;
use crate::stage::Stage;
use crate::synthesize::AnalysisSynthesizer;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalRequest {
    pub disease: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default, alias = "methodologyContent")]
    pub methodology: Option<String>,
    /// Zero when omitted; callers resolve it against the configured default.
    #[serde(default)]
    pub num_articles: usize,
}

/// Composite literature query from the extracted case features.
pub fn build_query(disease: &str, events: &[String]) -> Result<String> {
    let parts: Vec<&str> = std::iter::once(disease)
        .chain(events.iter().map(String::as_str))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return Err(PipelineError::validation(
            "disease and events are both empty; nothing to search for",
        ));
    }
    Ok(parts.join(". "))
}

struct CaseFeatures {
    disease: String,
    events: Vec<String>,
    methodology: Option<String>,
}

type ArticleOutcome = (String, Result<AnalyzedArticle>);

/// Searches, reranks and analyzes articles, streaming progress as it goes.
#[derive(Clone)]
pub struct ArticleRetriever {
    index: Arc<dyn LiteratureIndex>,
    synthesizer: AnalysisSynthesizer,
    config: Arc<PipelineConfig>,
}

impl ArticleRetriever {
    pub fn new(
        index: Arc<dyn LiteratureIndex>,
        synthesizer: AnalysisSynthesizer,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            index,
            synthesizer,
            config,
        }
    }

    /// Starts a fresh retrieval run.
    ///
    /// The stream always ends with exactly one terminal event: `done`, or a
    /// stream-scoped `error` when the query cannot be built or the search fails.
    pub fn retrieve(&self, request: RetrievalRequest) -> ProgressStream {
        let deadline = Instant::now() + self.config.retrieval_deadline();
        self.retrieve_until(request, deadline)
    }

    pub fn retrieve_until(&self, request: RetrievalRequest, deadline: Instant) -> ProgressStream {
        let (tx, stream) = ProgressStream::channel(self.config.channel_capacity);
        let retriever = self.clone();
        let span = info_span!("retrieval", disease = %request.disease);
        tokio::spawn(async move { retriever.run(request, deadline, tx).await }.instrument(span));
        stream
    }

    async fn run(self, request: RetrievalRequest, deadline: Instant, tx: mpsc::Sender<ProgressEvent>) {
        let query = match self.validate(&request) {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, "Rejected retrieval request");
                let _ = tx.send(ProgressEvent::fatal(Stage::Retrieving, &e)).await;
                return;
            }
        };

        let pool_size = request
            .num_articles
            .saturating_mul(self.config.overfetch_factor);
        let searching = ProgressEvent::status(
            Stage::Retrieving,
            format!("Searching literature for up to {pool_size} candidates"),
        );
        if tx.send(searching).await.is_err() {
            return;
        }

        let searched = tokio::select! {
            _ = tx.closed() => {
                debug!("Caller disconnected during literature search");
                return;
            }
            searched = timeout_at(deadline, self.index.search(&query, pool_size)) => searched,
        };
        let hits = match searched {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                error!(error = %e, "Literature search failed");
                let _ = tx
                    .send(ProgressEvent::fatal(Stage::Retrieving, &PipelineError::from(e)))
                    .await;
                return;
            }
            Err(_) => {
                warn!("Retrieval deadline reached during literature search");
                let _ = tx
                    .send(ProgressEvent::status(
                        Stage::Retrieving,
                        "Retrieval deadline reached before search completed",
                    ))
                    .await;
                let _ = tx
                    .send(ProgressEvent::Done(DoneSummary {
                        timed_out: true,
                        ..DoneSummary::default()
                    }))
                    .await;
                return;
            }
        };

        let pool = hits.len();
        let ranked = rank_candidates(hits, &self.config.ranking, request.num_articles);
        info!(pool, selected = ranked.len(), "Ranked literature candidates");
        let selected = ProgressEvent::status(
            Stage::Retrieving,
            format!("Selected {} of {} candidate articles", ranked.len(), pool),
        );
        if tx.send(selected).await.is_err() {
            return;
        }

        let features = Arc::new(CaseFeatures {
            disease: request.disease,
            events: request.events,
            methodology: request.methodology,
        });

        if let Some(summary) = self.analyze_all(ranked, features, deadline, &tx).await {
            info!(
                analyzed = summary.articles_analyzed,
                failed = summary.articles_failed,
                timed_out = summary.timed_out,
                "Retrieval finished"
            );
            let _ = tx.send(ProgressEvent::Done(summary)).await;
        }
    }

    fn validate(&self, request: &RetrievalRequest) -> Result<String> {
        if request.num_articles == 0 {
            return Err(PipelineError::validation("numArticles must be at least 1"));
        }
        if request.num_articles > self.config.max_num_articles {
            return Err(PipelineError::validation(format!(
                "numArticles must be at most {}",
                self.config.max_num_articles
            )));
        }
        build_query(&request.disease, &request.events)
    }

    /// Fans per-article work out under the concurrency bound.
    ///
    /// Returns `None` when the caller went away; dropping the `JoinSet` then aborts
    /// whatever is still in flight.
    async fn analyze_all(
        &self,
        ranked: Vec<ArticleCandidate>,
        features: Arc<CaseFeatures>,
        deadline: Instant,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> Option<DoneSummary> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut tasks: JoinSet<ArticleOutcome> = JoinSet::new();
        let mut ids: HashMap<task::Id, String> = HashMap::new();

        for candidate in ranked {
            let semaphore = semaphore.clone();
            let index = self.index.clone();
            let synthesizer = self.synthesizer.clone();
            let features = features.clone();
            let tx = tx.clone();
            let article_id = candidate.id.clone();
            let handle = tasks.spawn(async move {
                let id = candidate.id.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let cause = format!("concurrency limiter closed: {e}");
                        return (id.clone(), Err(PipelineError::AnalysisFailed { article_id: id, cause }));
                    }
                };
                let _ = tx
                    .send(ProgressEvent::article_status(&id, "Analyzing article"))
                    .await;
                let result = analyze_one(index.as_ref(), &synthesizer, &candidate, &features).await;
                (id, result)
            });
            ids.insert(handle.id(), article_id);
        }

        let mut summary = DoneSummary::default();
        loop {
            let joined = tokio::select! {
                _ = tx.closed() => {
                    debug!("Caller disconnected, abandoning article analysis");
                    return None;
                }
                joined = timeout_at(deadline, tasks.join_next()) => joined,
            };

            match joined {
                Ok(None) => break,
                Ok(Some(Ok(outcome))) => {
                    if !emit_outcome(outcome, &mut summary, tx).await {
                        return None;
                    }
                }
                Ok(Some(Err(e))) => {
                    if !emit_outcome(lost_outcome(&ids, e), &mut summary, tx).await {
                        return None;
                    }
                }
                Err(_) => {
                    warn!(
                        remaining = tasks.len(),
                        "Retrieval deadline reached, abandoning unfinished articles"
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        let outcome = match joined {
                            Ok(outcome) => outcome,
                            Err(e) if e.is_panic() => lost_outcome(&ids, e),
                            Err(_) => continue,
                        };
                        if !emit_outcome(outcome, &mut summary, tx).await {
                            return None;
                        }
                    }
                    summary.timed_out = true;
                    let notice = ProgressEvent::status(
                        Stage::Retrieving,
                        "Retrieval deadline reached; continuing with analyzed articles",
                    );
                    if tx.send(notice).await.is_err() {
                        return None;
                    }
                    break;
                }
            }
        }
        Some(summary)
    }
}

async fn analyze_one(
    index: &dyn LiteratureIndex,
    synthesizer: &AnalysisSynthesizer,
    candidate: &ArticleCandidate,
    features: &CaseFeatures,
) -> Result<AnalyzedArticle> {
    let content = index
        .fetch_content(candidate)
        .await
        .map_err(|e| PipelineError::AnalysisFailed {
            article_id: candidate.id.clone(),
            cause: e.to_string(),
        })?;

    synthesizer
        .analyze_article(
            candidate,
            &content,
            &features.disease,
            &features.events,
            features.methodology.as_deref(),
        )
        .await
}

/// Article-scoped failure for a task that ended without reporting a result.
fn lost_outcome(ids: &HashMap<task::Id, String>, err: JoinError) -> ArticleOutcome {
    let article_id = ids
        .get(&err.id())
        .cloned()
        .unwrap_or_else(|| format!("task {}", err.id()));
    error!(%article_id, error = %err, "Article analysis task aborted unexpectedly");
    let cause = format!("analysis task failed: {err}");
    (
        article_id.clone(),
        Err(PipelineError::AnalysisFailed { article_id, cause }),
    )
}

/// Sends one article's result; `false` means the caller is gone.
async fn emit_outcome(
    (id, result): ArticleOutcome,
    summary: &mut DoneSummary,
    tx: &mpsc::Sender<ProgressEvent>,
) -> bool {
    let event = match result {
        Ok(article) => {
            summary.articles_analyzed += 1;
            ProgressEvent::Article(article)
        }
        Err(e) => {
            warn!(article_id = %id, error = %e, "Article analysis failed");
            summary.articles_failed += 1;
            ProgressEvent::article_error(&id, &e)
        }
    };
    tx.send(event).await.is_ok()
}
