use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ErrorKind, PipelineError};
use crate::model::{AnalyzedArticle, FinalAnalysis};
use crate::stage::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    /// One article failed; the stream continues.
    Article,
    /// The whole stream failed; this is the terminal event.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub scope: ErrorScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSummary {
    pub articles_analyzed: usize,
    pub articles_failed: usize,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<FinalAnalysis>,
}

/// One unit of the streaming retrieval/analysis protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ProgressEvent {
    Status(StatusUpdate),
    Article(AnalyzedArticle),
    Error(ErrorReport),
    Done(DoneSummary),
}

impl ProgressEvent {
    pub fn status(stage: Stage, message: impl Into<String>) -> Self {
        ProgressEvent::Status(StatusUpdate {
            stage: Some(stage),
            article_id: None,
            message: message.into(),
        })
    }

    pub fn article_status(article_id: &str, message: impl Into<String>) -> Self {
        ProgressEvent::Status(StatusUpdate {
            stage: Some(Stage::Retrieving),
            article_id: Some(article_id.to_string()),
            message: message.into(),
        })
    }

    /// Inline failure scoped to a single article.
    pub fn article_error(article_id: &str, error: &PipelineError) -> Self {
        ProgressEvent::Error(ErrorReport {
            scope: ErrorScope::Article,
            article_id: Some(article_id.to_string()),
            stage: Some(Stage::Retrieving),
            kind: ErrorKind::PartialFailure,
            message: error.to_string(),
        })
    }

    /// Terminal failure of the whole stream.
    pub fn fatal(stage: Stage, error: &PipelineError) -> Self {
        ProgressEvent::Error(ErrorReport {
            scope: ErrorScope::Stream,
            article_id: None,
            stage: Some(stage),
            kind: error.kind(),
            message: error.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressEvent::Done(_) => true,
            ProgressEvent::Error(report) => report.scope == ErrorScope::Stream,
            _ => false,
        }
    }

    /// Serializes the event as one NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => format!(
                "{{\"type\":\"error\",\"payload\":{{\"scope\":\"stream\",\"kind\":\"pipeline_failed\",\"message\":\"event encoding failed: {}\"}}}}\n",
                e.to_string().replace('"', "'")
            ),
        }
    }
}

/// Receiving end of one request's event channel.
///
/// Dropping it closes the channel, which the producing task treats as caller
/// disconnect and uses to cancel its in-flight work.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    pub(crate) fn new(rx: mpsc::Receiver<ProgressEvent>) -> Self {
        Self { rx }
    }

    /// Channel pair for a producer task and the stream handed to the caller.
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<ProgressEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drains the stream to completion.
    pub async fn collect_all(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_wire_shape() {
        let line = ProgressEvent::status(Stage::Extracting, "Extracting features").to_line();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["payload"]["stage"], "extracting");
        assert_eq!(value["payload"]["message"], "Extracting features");
    }

    #[test]
    fn terminal_detection() {
        let failure = PipelineError::AnalysisFailed {
            article_id: "1".into(),
            cause: "timeout".into(),
        };
        assert!(!ProgressEvent::article_error("1", &failure).is_terminal());
        assert!(ProgressEvent::fatal(Stage::Retrieving, &failure).is_terminal());
        assert!(ProgressEvent::Done(DoneSummary::default()).is_terminal());
        assert!(!ProgressEvent::status(Stage::Retrieving, "x").is_terminal());
    }

    #[test]
    fn error_payload_parses_back() {
        let err = PipelineError::validation("disease and events are both empty");
        let event = ProgressEvent::fatal(Stage::Retrieving, &err);
        let parsed: ProgressEvent = serde_json::from_str(event.to_line().trim_end()).unwrap();
        match parsed {
            ProgressEvent::Error(report) => {
                assert_eq!(report.scope, ErrorScope::Stream);
                assert_eq!(report.kind, ErrorKind::ValidationError);
                assert!(report.article_id.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
