use async_trait::async_trait;
use case_flow::{Capability, CapabilityError};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::config::FeedbackConfig;

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";
pub const ANONYMOUS: &str = "Anonymous User";

/// A user's feedback about the app.
#[derive(Debug, Clone, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Feedback {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS)
    }

    /// The submitter's address, when it looks like one.
    pub fn reply_address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| email.contains('@'))
    }

    pub fn text(&self) -> Option<&str> {
        self.feedback
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn deliver(&self, feedback: &Feedback) -> Result<(), CapabilityError>;
}

/// Sends feedback to the team by SendGrid v3 mail-send.
pub struct SendGridSink {
    http: reqwest::Client,
    api_key: Option<String>,
    config: FeedbackConfig,
}

impl SendGridSink {
    pub fn new(http: reqwest::Client, api_key: Option<String>, config: FeedbackConfig) -> Self {
        Self {
            http,
            api_key,
            config,
        }
    }

    /// Team recipients, plus the submitter when they left a usable address.
    fn recipients(&self, feedback: &Feedback) -> Vec<String> {
        let mut recipients = self.config.recipients.clone();
        if let Some(email) = feedback.reply_address() {
            recipients.push(email.to_string());
        }
        recipients
    }

    fn message(&self, feedback: &Feedback, recipients: &[String]) -> Value {
        let html_content = format!(
            "<h2>New Feedback Received</h2>\
             <p><strong>From:</strong> {name}</p>\
             <p><strong>Email:</strong> {email}</p>\
             <p><strong>Feedback:</strong></p>\
             <p>{text}</p>\
             <p>Thank you for helping us improve the case analysis app.</p>",
            name = escape_html(feedback.display_name()),
            email = escape_html(feedback.email.as_deref().unwrap_or("No email provided")),
            text = escape_html(feedback.text().unwrap_or_default()),
        );
        let to: Vec<Value> = recipients
            .iter()
            .map(|email| json!({ "email": email }))
            .collect();

        json!({
            "personalizations": [{ "to": to }],
            "from": { "email": self.config.sender },
            "subject": self.config.subject,
            "content": [{ "type": "text/html", "value": html_content }],
        })
    }
}

#[async_trait]
impl FeedbackSink for SendGridSink {
    async fn deliver(&self, feedback: &Feedback) -> Result<(), CapabilityError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(CapabilityError::NotConfigured(Capability::Delivery))?;

        let recipients = self.recipients(feedback);
        if recipients.is_empty() {
            return Err(CapabilityError::NotConfigured(Capability::Delivery));
        }

        let response = self
            .http
            .post(SENDGRID_URL)
            .bearer_auth(api_key)
            .json(&self.message(feedback, &recipients))
            .send()
            .await
            .map_err(|e| {
                CapabilityError::request(Capability::Delivery, format!("SendGrid request failed: {e}"))
            })?;

        let status = response.status();
        info!(status = status.as_u16(), recipients = recipients.len(), "Feedback email sent");
        if !status.is_success() {
            return Err(CapabilityError::request(
                Capability::Delivery,
                format!("SendGrid returned HTTP {status}"),
            ));
        }
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(name: Option<&str>, email: Option<&str>, text: &str) -> Feedback {
        Feedback {
            name: name.map(str::to_string),
            email: email.map(str::to_string),
            feedback: Some(text.to_string()),
        }
    }

    fn sink(api_key: Option<&str>) -> SendGridSink {
        SendGridSink::new(
            reqwest::Client::new(),
            api_key.map(str::to_string),
            FeedbackConfig {
                recipients: vec!["team@example.org".into()],
                ..FeedbackConfig::default()
            },
        )
    }

    #[test]
    fn submitter_is_added_only_with_valid_address() {
        let sink = sink(Some("key"));
        assert_eq!(
            sink.recipients(&feedback(None, Some("dr@clinic.org"), "Great")),
            vec!["team@example.org", "dr@clinic.org"]
        );
        assert_eq!(
            sink.recipients(&feedback(None, Some("not-an-email"), "Great")),
            vec!["team@example.org"]
        );
    }

    #[test]
    fn name_defaults_to_anonymous() {
        assert_eq!(feedback(None, None, "x").display_name(), ANONYMOUS);
        assert_eq!(feedback(Some("  "), None, "x").display_name(), ANONYMOUS);
        assert_eq!(feedback(Some("Dr. Ilan"), None, "x").display_name(), "Dr. Ilan");
    }

    #[test]
    fn message_escapes_user_content() {
        let sink = sink(Some("key"));
        let fb = feedback(Some("<b>Eve</b>"), None, "a < b");
        let message = sink.message(&fb, &sink.recipients(&fb));
        let html = message["content"][0]["value"].as_str().unwrap();
        assert!(html.contains("&lt;b&gt;Eve&lt;/b&gt;"));
        assert!(html.contains("a &lt; b"));
        assert_eq!(message["personalizations"][0]["to"][0]["email"], "team@example.org");
    }

    #[tokio::test]
    async fn missing_api_key_is_not_configured() {
        let err = sink(None)
            .deliver(&feedback(None, None, "Great"))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::NotConfigured(Capability::Delivery)));
    }
}
