pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod rank;
pub mod retrieve;
pub mod stage;
pub mod store;
pub mod synthesize;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use capability::{LiteratureIndex, PiiRedaction, TextGeneration, TextStream};
pub use config::{EventFormat, PipelineConfig, RankingWeights, RedactionPolicy};
pub use error::{Capability, CapabilityError, ErrorKind, PipelineError, Result};
pub use event::{DoneSummary, ErrorReport, ErrorScope, ProgressEvent, ProgressStream, StatusUpdate};
pub use extract::{EventParser, FeatureExtractor, JsonArrayEventParser, QuotedEventParser};
pub use model::{
    AnalyzedArticle, ArticleCandidate, Case, ChatRole, ChatTurn, Confidence, FinalAnalysis,
    SearchHit,
};
pub use orchestrator::{CaseRequest, PipelineComponents, PipelineOrchestrator};
pub use retrieve::{ArticleRetriever, RetrievalRequest};
pub use stage::{PipelineState, Stage};
pub use store::{ChatKey, ChatStore, InMemoryChatStore};
pub use synthesize::AnalysisSynthesizer;
pub use wire::{LineDecoder, SseDecoder, SseFrame};
