use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use case_flow::{ArticleCandidate, Capability, CapabilityError, LiteratureIndex, SearchHit};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::pubmed::PubMedClient;

const SEARCH_SQL: &str = "SELECT pmid, title, COALESCE(abstract, ''), \
     COALESCE(journal_rank, 0)::float8, COALESCE(full_text_available, false), \
     (1 - (embedding <=> $1::vector))::float8 AS similarity \
     FROM articles \
     ORDER BY embedding <=> $1::vector \
     LIMIT $2";

type ArticleRow = (String, String, String, f64, bool, f64);

/// Lazily loaded sentence-embedding model shared by all requests.
#[derive(Clone, Default)]
pub struct QueryEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
}

impl QueryEmbedder {
    /// Generate embedding for text using fastembed
    pub async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let input = text.to_owned();
        let model = self.model.clone();

        // ONNX inference is CPU bound; keep it off the async workers.
        let embedding = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            if guard.is_none() {
                info!("Loading embedding model");
                *guard = Some(TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_show_download_progress(false),
                )?);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("embedding model unavailable"))?;
            let embeddings = model.embed(vec![input], None)?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding model returned no vectors"))
        })
        .await??;

        info!(dimensions = embedding.len(), "Query embedded");
        Ok(embedding)
    }
}

/// pgvector nearest-neighbour search over the article corpus, with detail from PubMed.
#[derive(Clone)]
pub struct PgVectorIndex {
    pool: PgPool,
    embedder: QueryEmbedder,
    pubmed: PubMedClient,
}

impl PgVectorIndex {
    pub async fn connect(database_url: &str, pubmed: PubMedClient) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            embedder: QueryEmbedder::default(),
            pubmed,
        })
    }
}

#[async_trait]
impl LiteratureIndex for PgVectorIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, CapabilityError> {
        let embedding = self.embedder.embed(query).await.map_err(|e| {
            CapabilityError::request(Capability::Search, format!("Embedding generation failed: {e}"))
        })?;

        let rows = sqlx::query_as::<_, ArticleRow>(SEARCH_SQL)
            .bind(vector_literal(&embedding))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                CapabilityError::request(Capability::Search, format!("Database query failed: {e}"))
            })?;

        info!(results = rows.len(), limit, "Vector search completed");
        Ok(rows.into_iter().map(into_hit).collect())
    }

    async fn fetch_content(&self, article: &ArticleCandidate) -> Result<String, CapabilityError> {
        if article.full_text_available {
            match self.pubmed.fetch_full_text(&article.id).await {
                Ok(Some(text)) => return Ok(text),
                Ok(None) => debug!(article_id = %article.id, "No PMC body, using abstract"),
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "Full text lookup failed, using abstract")
                }
            }
        }

        match self.pubmed.fetch_abstract(&article.id).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) if !article.abstract_text.trim().is_empty() => Ok(article.abstract_text.clone()),
            Ok(None) => Err(CapabilityError::invalid(
                Capability::Search,
                format!("No abstract available for PMID {}", article.id),
            )),
            Err(e) if !article.abstract_text.trim().is_empty() => {
                warn!(article_id = %article.id, error = %e, "PubMed lookup failed, using stored abstract");
                Ok(article.abstract_text.clone())
            }
            Err(e) => Err(e),
        }
    }
}

/// Text form of a vector accepted by pgvector's input function.
fn vector_literal(embedding: &[f32]) -> String {
    let values = embedding
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{values}]")
}

fn into_hit(row: ArticleRow) -> SearchHit {
    let (id, title, abstract_text, journal_rank, full_text_available, similarity) = row;
    SearchHit {
        id,
        title,
        abstract_text,
        similarity,
        journal_rank,
        full_text_available,
    }
}
