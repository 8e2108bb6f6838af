//! Mailbox access: the `MailboxClient` trait and its Gmail implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{Label, Message, MessagePart, ModifyMessageRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::auth::GmailHub;
use crate::error::{CategorizerError, Result};
use crate::models::EmailMessage;
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};

const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";

/// Largest page `messages.list` will return
const MAX_PAGE_SIZE: usize = 500;

/// Label info returned from the mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
    /// `"user"` or `"system"` when the provider says
    pub label_type: Option<String>,
    /// Only filled by `get_label`; listings leave counts empty
    pub messages_total: Option<u32>,
    pub messages_unread: Option<u32>,
}

impl LabelInfo {
    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::typed(id, name, "user")
    }

    pub fn system(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::typed(id, name, "system")
    }

    fn typed(id: impl Into<String>, name: impl Into<String>, label_type: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label_type: Some(label_type.to_string()),
            messages_total: None,
            messages_unread: None,
        }
    }

    pub fn with_counts(mut self, total: u32, unread: u32) -> Self {
        self.messages_total = Some(total);
        self.messages_unread = Some(unread);
        self
    }

    pub fn is_system(&self) -> bool {
        self.label_type.as_deref() == Some("system")
    }
}

/// Mailbox operations the pipeline depends on
///
/// Implementations do not retry; callers wrap calls in a `RetryExecutor`.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Ids matching `query`, in provider order, at most `limit`
    async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>>;

    async fn get_message(&self, id: &str) -> Result<EmailMessage>;

    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// One label with its message counts
    async fn get_label(&self, id: &str) -> Result<LabelInfo>;

    /// Create a label and return its id
    async fn create_label(&self, name: &str) -> Result<String>;

    /// Add a label to a message; adding a label it already has is a no-op
    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: MailboxClient + ?Sized> MailboxClient for Arc<T> {
    async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.as_ref().list_message_ids(query, limit).await
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.as_ref().get_message(id).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.as_ref().list_labels().await
    }

    async fn get_label(&self, id: &str) -> Result<LabelInfo> {
        self.as_ref().get_label(id).await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.as_ref().create_label(name).await
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.as_ref().apply_label(message_id, label_id).await
    }
}

/// Gmail-backed mailbox charged against a quota-unit bucket
pub struct GmailMailboxClient {
    hub: GmailHub,
    quota: QuotaRateLimiter,
}

impl GmailMailboxClient {
    pub fn new(hub: GmailHub, quota: QuotaRateLimiter) -> Self {
        Self { hub, quota }
    }

    pub fn quota(&self) -> &QuotaRateLimiter {
        &self.quota
    }
}

#[async_trait]
impl MailboxClient for GmailMailboxClient {
    async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(MAX_PAGE_SIZE) as u32;
            self.quota.acquire(QuotaCost::ListMessages).await;

            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(page_size);
            if let Some(token) = page_token.as_ref() {
                call = call.page_token(token);
            }

            let (_, response) = call.add_scope(MODIFY_SCOPE).doit().await?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(limit);
        debug!("Listed {} message ids for query '{}'", ids.len(), query);
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.quota.acquire(QuotaCost::GetMessage).await;

        let (_, message) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .add_scope(MODIFY_SCOPE)
            .doit()
            .await?;

        parse_message(message)
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.quota.acquire(QuotaCost::ListLabels).await;

        let (_, response) = self
            .hub
            .users()
            .labels_list("me")
            .add_scope(LABELS_SCOPE)
            .doit()
            .await?;

        let labels: Vec<LabelInfo> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(label_info)
            .collect();

        debug!("Fetched {} labels", labels.len());
        Ok(labels)
    }

    async fn get_label(&self, id: &str) -> Result<LabelInfo> {
        self.quota.acquire(QuotaCost::GetLabel).await;

        let (_, label) = self
            .hub
            .users()
            .labels_get("me", id)
            .add_scope(LABELS_SCOPE)
            .doit()
            .await?;

        label_info(label)
            .ok_or_else(|| CategorizerError::LabelError(format!("Label {} has no ID or name", id)))
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.quota.acquire(QuotaCost::CreateLabel).await;

        let label = Label {
            name: Some(name.to_string()),
            message_list_visibility: Some("show".to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            ..Default::default()
        };

        let (_, created) = self
            .hub
            .users()
            .labels_create(label, "me")
            .add_scope(LABELS_SCOPE)
            .doit()
            .await?;

        created
            .id
            .ok_or_else(|| CategorizerError::LabelError(format!("Created label '{}' has no ID", name)))
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.quota.acquire(QuotaCost::ModifyMessage).await;

        let request = ModifyMessageRequest {
            add_label_ids: Some(vec![label_id.to_string()]),
            remove_label_ids: None,
        };

        self.hub
            .users()
            .messages_modify(request, "me", message_id)
            .add_scope(MODIFY_SCOPE)
            .doit()
            .await?;

        Ok(())
    }
}

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static HTML_HIDDEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(style|script)[^>]*>.*?</(style|script)>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn label_info(label: Label) -> Option<LabelInfo> {
    let count = |n: Option<i32>| n.map(|n| n.max(0) as u32);
    Some(LabelInfo {
        id: label.id?,
        name: label.name?,
        label_type: label.type_,
        messages_total: count(label.messages_total),
        messages_unread: count(label.messages_unread),
    })
}

/// Convert a Gmail API message into an `EmailMessage`
fn parse_message(message: Message) -> Result<EmailMessage> {
    let id = message
        .id
        .ok_or_else(|| CategorizerError::InvalidMessageFormat("Missing message ID".to_string()))?;
    let thread_id = message.thread_id.unwrap_or_else(|| id.clone());

    let mut sender = String::new();
    let mut subject = String::new();
    let mut date_header = None;

    let payload = message.payload.as_ref();
    for header in payload.and_then(|p| p.headers.as_ref()).into_iter().flatten() {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => sender = value.clone(),
                "subject" => subject = value.clone(),
                "date" => date_header = Some(value.clone()),
                _ => {}
            }
        }
    }

    let mut text = None;
    let mut html = None;
    if let Some(part) = payload {
        collect_bodies(part, &mut text, &mut html);
    }
    let body = text
        .or_else(|| html.map(|h| html_to_text(&h)))
        .or(message.snippet)
        .unwrap_or_default();

    let received_at = message
        .internal_date
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or_else(|| date_header.as_deref().and_then(|d| parse_date(d).ok()));

    let mut email = EmailMessage::new(id, thread_id, sender, subject, &body)
        .with_label_ids(message.label_ids.unwrap_or_default());
    email.received_at = received_at;
    Ok(email)
}

/// Walk the MIME tree keeping the first text/plain and text/html bodies
fn collect_bodies(part: &MessagePart, text: &mut Option<String>, html: &mut Option<String>) {
    let is_attachment = part.filename.as_deref().map(|f| !f.is_empty()).unwrap_or(false);
    let data = part.body.as_ref().and_then(|b| b.data.as_ref());

    if let (false, Some(data)) = (is_attachment, data) {
        match part.mime_type.as_deref() {
            Some("text/plain") if text.is_none() => {
                *text = Some(String::from_utf8_lossy(data).into_owned())
            }
            Some("text/html") if html.is_none() => {
                *html = Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => {}
        }
    }

    for child in part.parts.iter().flatten() {
        collect_bodies(child, text, html);
    }
}

fn html_to_text(html: &str) -> String {
    let visible = HTML_HIDDEN.replace_all(html, " ");
    let stripped = HTML_TAG.replace_all(&visible, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

/// Parse RFC 2822 date string
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| CategorizerError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn part(mime: &str, data: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: Some(MessagePartBody {
                data: Some(data.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_message_prefers_plain_text() {
        let message = Message {
            id: Some("m1".to_string()),
            thread_id: Some("t1".to_string()),
            label_ids: Some(vec!["INBOX".to_string()]),
            internal_date: Some(1_700_000_000_000),
            payload: Some(MessagePart {
                mime_type: Some("multipart/alternative".to_string()),
                headers: Some(vec![
                    header("From", "Billing <billing@example.com>"),
                    header("Subject", "Your invoice"),
                ]),
                parts: Some(vec![
                    part("text/html", "<p>HTML body</p>"),
                    part("text/plain", "Plain body"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let email = parse_message(message).unwrap();
        assert_eq!(email.id, "m1");
        assert_eq!(email.thread_id, "t1");
        assert_eq!(email.sender, "Billing <billing@example.com>");
        assert_eq!(email.subject, "Your invoice");
        assert_eq!(email.body_excerpt, "Plain body");
        assert_eq!(email.label_ids, vec!["INBOX".to_string()]);
        assert_eq!(email.received_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_message_falls_back_to_html_then_snippet() {
        let html_only = Message {
            id: Some("m2".to_string()),
            payload: Some(part(
                "text/html",
                "<style>p{color:red}</style><p>Sale&nbsp;ends <b>today</b></p>",
            )),
            ..Default::default()
        };
        let email = parse_message(html_only).unwrap();
        assert_eq!(email.body_excerpt, "Sale ends today");
        assert_eq!(email.thread_id, "m2");

        let snippet_only = Message {
            id: Some("m3".to_string()),
            snippet: Some("Just a snippet".to_string()),
            payload: Some(MessagePart {
                headers: Some(vec![header("Date", "Tue, 1 Jul 2003 10:52:37 +0200")]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let email = parse_message(snippet_only).unwrap();
        assert_eq!(email.body_excerpt, "Just a snippet");
        assert_eq!(email.received_at.unwrap().timestamp(), 1_057_049_557);
    }

    #[test]
    fn test_parse_message_requires_id() {
        let result = parse_message(Message::default());
        assert!(matches!(result, Err(CategorizerError::InvalidMessageFormat(_))));
    }

    #[test]
    fn test_attachments_are_not_bodies() {
        let mut attachment = part("text/plain", "attached file contents");
        attachment.filename = Some("notes.txt".to_string());
        let message = Message {
            id: Some("m4".to_string()),
            snippet: Some("Snippet wins".to_string()),
            payload: Some(MessagePart {
                parts: Some(vec![attachment]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(parse_message(message).unwrap().body_excerpt, "Snippet wins");
    }

    #[test]
    fn test_parse_date() {
        let rfc2822 = parse_date("Mon, 1 Jan 2024 12:00:00 +0000").unwrap();
        assert_eq!(rfc2822.timestamp(), 1_704_110_400);
        assert!(parse_date("not a date").is_err());
    }

    #[test]
    fn test_label_info_system_detection() {
        assert!(LabelInfo::system("SPAM", "SPAM").is_system());
        assert!(!LabelInfo::user("Label_1", "Work").is_system());
    }

    #[test]
    fn test_label_info_conversion() {
        let label = Label {
            id: Some("Label_3".to_string()),
            name: Some("AI/Work".to_string()),
            type_: Some("user".to_string()),
            messages_total: Some(42),
            messages_unread: Some(-1),
            ..Default::default()
        };
        let info = label_info(label).unwrap();
        assert_eq!(info.name, "AI/Work");
        assert_eq!(info.messages_total, Some(42));
        assert_eq!(info.messages_unread, Some(0));

        assert!(label_info(Label::default()).is_none());
    }
}
