//! Category-to-label resolution with create-once semantics
//!
//! A `LabelResolver` lives for one run. The first lookup fetches the mailbox's
//! existing labels; names not found there are created. Each label name has its
//! own once-cell, so concurrent workers asking for the same unseen category
//! wait for a single creation instead of racing.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::client::{LabelInfo, MailboxClient};
use crate::error::{CategorizerError, Result};
use crate::models::CategorySet;
use crate::retry::RetryExecutor;

/// Gmail's limit on label name length
const MAX_LABEL_NAME_CHARS: usize = 225;

/// Names held by Gmail system labels; user labels cannot take them
const RESERVED_LABEL_NAMES: &[&str] = &[
    "INBOX", "SPAM", "TRASH", "UNREAD", "STARRED", "IMPORTANT", "SENT", "DRAFT", "CHAT",
];

/// User labels present in the mailbox when the run started
#[derive(Debug, Default)]
struct LabelSnapshot {
    /// lowercase name -> id
    by_name: HashMap<String, String>,
    /// id -> name
    by_id: HashMap<String, String>,
}

impl LabelSnapshot {
    fn from_labels(labels: Vec<LabelInfo>) -> Self {
        let mut snapshot = Self::default();
        for label in labels.into_iter().filter(|l| !l.is_system()) {
            snapshot
                .by_name
                .insert(label.name.to_lowercase(), label.id.clone());
            snapshot.by_id.insert(label.id, label.name);
        }
        snapshot
    }
}

pub struct LabelResolver {
    mailbox: Arc<dyn MailboxClient>,
    retry: RetryExecutor,
    prefix: Option<String>,
    snapshot: OnceCell<LabelSnapshot>,
    registry: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
    created: Mutex<Vec<String>>,
}

impl LabelResolver {
    pub fn new(mailbox: Arc<dyn MailboxClient>, retry: RetryExecutor, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim().trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            mailbox,
            retry,
            prefix,
            snapshot: OnceCell::new(),
            registry: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Label id for `category`, creating the label on first use
    pub async fn resolve(&self, category: &str) -> Result<String> {
        let name = label_name(self.prefix.as_deref(), category)?;
        self.resolve_label(&name).await
    }

    /// Names of labels this resolver created
    pub async fn labels_created(&self) -> Vec<String> {
        self.created.lock().await.clone()
    }

    /// Configured category already applied to a message, from its label ids
    ///
    /// Returns `None` when the label snapshot cannot be loaded.
    pub async fn category_for_labels(
        &self,
        label_ids: &[String],
        categories: &CategorySet,
    ) -> Option<String> {
        if label_ids.is_empty() {
            return None;
        }
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Could not load labels to read previous category: {}", e);
                return None;
            }
        };

        label_ids
            .iter()
            .filter_map(|id| snapshot.by_id.get(id))
            .filter_map(|name| self.strip_prefix(name))
            .find_map(|name| categories.canonicalize(name))
            .map(str::to_string)
    }

    fn strip_prefix<'a>(&self, label_name: &'a str) -> Option<&'a str> {
        match &self.prefix {
            None => Some(label_name),
            Some(prefix) => {
                let head = label_name.get(..prefix.len())?;
                if head.eq_ignore_ascii_case(prefix) {
                    label_name[prefix.len()..].strip_prefix('/')
                } else {
                    None
                }
            }
        }
    }

    fn resolve_label<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let slot = {
                let mut registry = self.registry.lock().await;
                Arc::clone(registry.entry(name.to_lowercase()).or_default())
            };

            let id = slot.get_or_try_init(|| self.lookup_or_create(name)).await?;
            Ok(id.clone())
        }
        .boxed()
    }

    async fn lookup_or_create(&self, name: &str) -> Result<String> {
        if let Some(id) = self.snapshot().await?.by_name.get(&name.to_lowercase()) {
            debug!("Label '{}' already exists with ID {}", name, id);
            return Ok(id.clone());
        }

        if is_reserved_label_name(name) {
            return Err(CategorizerError::LabelError(format!(
                "'{}' is reserved for a Gmail system label; set labels.prefix to nest it",
                name
            )));
        }

        if let Some((parent, _)) = name.rsplit_once('/') {
            self.resolve_label(parent).await?;
        }

        info!("Creating label: {}", name);
        match self
            .retry
            .run("create_label", || self.mailbox.create_label(name))
            .await
        {
            Ok(id) => {
                self.created.lock().await.push(name.to_string());
                info!("Created label '{}' with ID: {}", name, id);
                Ok(id)
            }
            Err(CategorizerError::Conflict(reason)) => {
                info!("Label '{}' already exists ({}), refreshing labels", name, reason);
                self.find_existing(name).await
            }
            Err(e) => {
                warn!("Failed to create label '{}': {}", name, e);
                Err(e)
            }
        }
    }

    /// Look a label up in a fresh listing, bypassing the snapshot
    async fn find_existing(&self, name: &str) -> Result<String> {
        let labels = self
            .retry
            .run("list_labels", || self.mailbox.list_labels())
            .await?;

        labels
            .into_iter()
            .find(|l| !l.is_system() && l.name.eq_ignore_ascii_case(name))
            .map(|l| l.id)
            .ok_or_else(|| {
                CategorizerError::LabelError(format!(
                    "Label '{}' reported as existing but not found",
                    name
                ))
            })
    }

    async fn snapshot(&self) -> Result<&LabelSnapshot> {
        self.snapshot
            .get_or_try_init(|| async {
                let labels = self
                    .retry
                    .run("list_labels", || self.mailbox.list_labels())
                    .await?;
                let snapshot = LabelSnapshot::from_labels(labels);
                info!("Loaded {} existing user labels", snapshot.by_name.len());
                Ok::<_, CategorizerError>(snapshot)
            })
            .await
    }
}

/// Label name for `category`, nested under `prefix` when given
pub fn label_name(prefix: Option<&str>, category: &str) -> Result<String> {
    match prefix.map(|p| p.trim().trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => sanitize_label_name(&format!("{}/{}", prefix, category)),
        None => sanitize_label_name(category),
    }
}

/// Whether Gmail refuses `name` as a user label
pub fn is_reserved_label_name(name: &str) -> bool {
    let name = name.trim();
    RESERVED_LABEL_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Split categories into those that already have a user label and those that don't
pub fn category_label_coverage(
    labels: &[LabelInfo],
    categories: &CategorySet,
    prefix: Option<&str>,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut labelled = Vec::new();
    let mut unlabelled = Vec::new();
    for category in categories.names() {
        let name = label_name(prefix, category)?;
        if find_user_label(labels, &name).is_some() {
            labelled.push(category.clone());
        } else {
            unlabelled.push(category.clone());
        }
    }
    Ok((labelled, unlabelled))
}

/// Message counts of the label behind one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLabelCounts {
    pub category: String,
    pub label_name: String,
    pub total: u32,
    pub unread: u32,
}

/// Fetch message counts for every category whose label exists
///
/// Categories without a label are left out.
pub async fn category_label_counts(
    mailbox: &dyn MailboxClient,
    labels: &[LabelInfo],
    categories: &CategorySet,
    prefix: Option<&str>,
) -> Result<Vec<CategoryLabelCounts>> {
    let mut found = Vec::new();
    for category in categories.names() {
        let name = label_name(prefix, category)?;
        if let Some(label) = find_user_label(labels, &name) {
            found.push((category.as_str(), label));
        }
    }

    try_join_all(found.into_iter().map(|(category, label)| async move {
        let detail = mailbox.get_label(&label.id).await?;
        Ok::<_, CategorizerError>(CategoryLabelCounts {
            category: category.to_string(),
            label_name: label.name.clone(),
            total: detail.messages_total.unwrap_or(0),
            unread: detail.messages_unread.unwrap_or(0),
        })
    }))
    .await
}

fn find_user_label<'a>(labels: &'a [LabelInfo], name: &str) -> Option<&'a LabelInfo> {
    labels
        .iter()
        .find(|l| !l.is_system() && l.name.eq_ignore_ascii_case(name))
}

/// Normalize a label name for Gmail
///
/// Trims whitespace around each `/` segment, drops empty segments and
/// enforces Gmail's length limit.
pub fn sanitize_label_name(name: &str) -> Result<String> {
    let segments: Vec<String> = name
        .split('/')
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        return Err(CategorizerError::LabelError(
            "Label name cannot be empty".to_string(),
        ));
    }

    let sanitized = segments.join("/");
    if sanitized.chars().count() > MAX_LABEL_NAME_CHARS {
        return Err(CategorizerError::LabelError(format!(
            "Label name '{}' exceeds {} characters",
            sanitized, MAX_LABEL_NAME_CHARS
        )));
    }

    Ok(sanitized)
}
