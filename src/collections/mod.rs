//! Collection Service boundary.
//!
//! The remote entity-collection search service, specified here at its
//! interface only: the data it returns, and the [`CollectionService`] trait
//! the workflows consume. The production HTTP implementation lives in
//! [`http`]; tests substitute stubs.

pub mod http;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::CollectionError;

/// Lifecycle status of a remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    /// All searches and enrichments have settled.
    Idle,
    Running,
    Paused,
}

/// Progress of one search within a collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SearchProgress {
    pub found: u64,
    pub analyzed: u64,
}

/// One search attached to a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionSearch {
    #[serde(default)]
    pub progress: Option<SearchProgress>,
}

/// An enrichment definition attached to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentDef {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A remote collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub status: CollectionStatus,
    #[serde(default)]
    pub searches: Vec<CollectionSearch>,
    #[serde(default)]
    pub enrichments: Vec<EnrichmentDef>,
}

/// One enrichment result carried on an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEnrichment {
    pub enrichment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub result: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One criterion evaluation carried on an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEvaluation {
    pub criterion: String,
    /// `"yes"`, `"no"`, or `"unclear"`.
    pub satisfied: String,
}

/// A raw item record as returned by the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub enrichments: Vec<ItemEnrichment>,
    #[serde(default)]
    pub evaluations: Vec<ItemEvaluation>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RawItem {
    /// Display name drawn from nested properties: company name, person name,
    /// article title, else the free-form description.
    pub fn display_name(&self) -> Option<&str> {
        let props = self.properties.as_object()?;
        for path in [["company", "name"], ["person", "name"], ["article", "title"]] {
            if let Some(name) = props
                .get(path[0])
                .and_then(|v| v.get(path[1]))
                .and_then(|v| v.as_str())
            {
                return Some(name);
            }
        }
        props.get("description").and_then(|v| v.as_str())
    }

    /// Canonical URL for the item, when the service provided one.
    pub fn url(&self) -> Option<&str> {
        self.properties.get("url").and_then(|v| v.as_str())
    }

    /// One-line rendering for progress messages and research prompts.
    pub fn summarize(&self) -> String {
        let name = self.display_name().unwrap_or("unknown");
        match self.url() {
            Some(url) if !url.is_empty() => format!("{name} ({url})"),
            _ => name.to_string(),
        }
    }

    /// Whether the item passed its verification criteria. Items without
    /// evaluations pass by default.
    pub fn passes_evaluations(&self) -> bool {
        self.evaluations.is_empty() || self.evaluations.iter().any(|e| e.satisfied == "yes")
    }
}

/// Entity kind constraint for a search, e.g. `{"type": "company"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityKind {
    #[serde(rename = "type")]
    pub kind: String,
}

/// A verification criterion applied to every found item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub description: String,
}

/// Option label for an options-format enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentOption {
    pub label: String,
}

/// An enrichment to request on every found item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentSpec {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<EnrichmentOption>,
}

/// Parameters for creating a collection.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCollection {
    pub query: String,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<Criterion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<EnrichmentSpec>,
}

/// A recurring refresh schedule for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Parameters for a research run over one entity.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchRequest {
    pub instructions: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// Handle for a submitted research run.
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchJob {
    pub id: String,
}

/// Finished research output.
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchOutput {
    pub id: String,
    pub content: String,
}

/// Async sequence of raw item records from one collection.
pub type ItemStream = Pin<Box<dyn Stream<Item = Result<RawItem, CollectionError>> + Send>>;

/// The remote search service the workflows run against.
#[async_trait]
pub trait CollectionService: Send + Sync {
    async fn create_collection(&self, spec: CreateCollection)
    -> Result<Collection, CollectionError>;

    async fn get_collection(&self, id: &str) -> Result<Collection, CollectionError>;

    /// Stop all in-flight searches on a collection. Best-effort on cleanup
    /// paths; callers there swallow the error.
    async fn cancel_collection(&self, id: &str) -> Result<(), CollectionError>;

    async fn delete_collection(&self, id: &str) -> Result<(), CollectionError>;

    /// Stream every item in the collection. Callers bound the read with
    /// their own cap.
    async fn stream_items(&self, collection_id: &str) -> Result<ItemStream, CollectionError>;

    async fn create_schedule(
        &self,
        collection_id: &str,
        schedule: ScheduleSpec,
    ) -> Result<(), CollectionError>;

    /// Submit a research run; the per-entity fan-out workflow consumes this.
    async fn create_research(
        &self,
        request: ResearchRequest,
    ) -> Result<ResearchJob, CollectionError>;

    /// Wait for a research run to finish, up to `timeout`.
    async fn poll_research(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ResearchOutput, CollectionError>;
}
