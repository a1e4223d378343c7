use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};

/// A Confluence content event, e.g. `avi:confluence:updated:page`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageEvent {
    pub event_type: String,
    pub content: EventContent,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EventContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

impl PageEvent {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to decode content event JSON")
    }

    /// Id of the page the event is about. Other content types (blog posts, comments) are refused.
    pub fn page_id(&self) -> Result<&str> {
        if self.content.content_type != "page" {
            bail!("invalid content type '{}'", self.content.content_type);
        }
        if self.content.id.trim().is_empty() {
            bail!("content event carries no page id");
        }
        Ok(self.content.id.trim())
    }

    /// Third component of the event type (`created`, `updated`, ...).
    pub fn action(&self) -> &str {
        self.event_type.split(':').nth(2).unwrap_or(&self.event_type)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::PageEvent;

    #[test]
    fn parses_page_update_event() {
        let event = PageEvent::parse(
            r#"{
                "eventType": "avi:confluence:updated:page",
                "atlassianId": "abc",
                "content": {"id": "229379", "type": "page", "title": "Acme rollout", "status": "current"}
            }"#,
        )
        .expect("parse");
        assert_eq!(event.page_id().expect("page id"), "229379");
        assert_eq!(event.action(), "updated");
        assert_eq!(event.content.title, "Acme rollout");
    }

    #[test]
    fn accepts_numeric_content_id() {
        let event = PageEvent::parse(
            r#"{"eventType": "avi:confluence:created:page", "content": {"id": 42, "type": "page"}}"#,
        )
        .expect("parse");
        assert_eq!(event.page_id().expect("page id"), "42");
        assert_eq!(event.action(), "created");
    }

    #[test]
    fn rejects_non_page_content() {
        let event = PageEvent::parse(
            r#"{"eventType": "avi:confluence:created:blogpost", "content": {"id": "7", "type": "blogpost"}}"#,
        )
        .expect("parse");
        let error = event.page_id().expect_err("blog posts are not synced");
        assert!(error.to_string().contains("'blogpost'"));
    }

    #[test]
    fn missing_content_is_a_decode_error() {
        assert!(PageEvent::parse(r#"{"eventType": "avi:confluence:created:page"}"#).is_err());
    }

    #[test]
    fn action_falls_back_to_whole_event_type() {
        let event = PageEvent::parse(r#"{"eventType": "manual", "content": {"id": "1", "type": "page"}}"#)
            .expect("parse");
        assert_eq!(event.action(), "manual");
    }
}
