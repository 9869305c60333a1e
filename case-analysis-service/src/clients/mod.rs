pub mod feedback;
pub mod llm;
pub mod pubmed;
pub mod redactor;
pub mod vector_search;

pub use feedback::{Feedback, FeedbackSink, SendGridSink};
pub use llm::OpenRouterGenerator;
pub use pubmed::PubMedClient;
pub use redactor::{GenerativeRedactor, HttpRedactor};
pub use vector_search::{PgVectorIndex, QueryEmbedder};
