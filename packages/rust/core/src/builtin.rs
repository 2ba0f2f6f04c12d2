//! Plugin types bundled with Newsloom.
//!
//! | type | role |
//! |---|---|
//! | `sqlite` | storage over a libSQL file (`params.path`) |
//! | `memory` | in-process storage |
//! | `json-file` | source reading a JSON array; historical when `params.historical_dir` is set |
//! | `keyword-tags` | enricher tagging items whose text mentions configured keywords |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::debug;

use newsloom_shared::{
    ContentItem, Enricher, HistoricalSource, NewsloomError, Result, Source, expand_home,
};
use newsloom_storage::{MemoryStorage, SqliteStore};

use crate::plugins::{Plugin, PluginFactory};

/// Register every bundled type on `factory`.
pub fn register_builtins(factory: &mut PluginFactory) {
    factory.register("sqlite", |args| {
        #[derive(Deserialize)]
        struct Params {
            path: String,
        }
        let params: Params = args.params()?;
        Ok(Plugin::Storage(Arc::new(SqliteStore::new(expand_home(
            &params.path,
        )))))
    });

    factory.register("memory", |_| Ok(Plugin::Storage(Arc::new(MemoryStorage::new()))));

    factory.register("json-file", |args| {
        let params: JsonFileParams = args.params()?;
        if params.path.is_none() && params.historical_dir.is_none() {
            return Err(NewsloomError::config(format!(
                "json-file source '{}' needs params.path or params.historical_dir",
                args.name
            )));
        }
        let source = Arc::new(JsonFileSource {
            name: args.name,
            path: params.path.as_deref().map(expand_home),
            historical_dir: params.historical_dir.as_deref().map(expand_home),
            kind: params.kind,
        });
        Ok(if source.historical_dir.is_some() {
            Plugin::HistoricalSource(source)
        } else {
            Plugin::Source(source)
        })
    });

    factory.register("keyword-tags", |args| {
        let params: KeywordParams = args.params()?;
        Ok(Plugin::Enricher(Arc::new(KeywordTagger::new(
            args.name, params,
        ))))
    });
}

// ---------------------------------------------------------------------------
// json-file source
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct JsonFileParams {
    path: Option<String>,
    historical_dir: Option<String>,
    #[serde(default = "default_kind")]
    kind: String,
}

fn default_kind() -> String {
    "jsonItem".into()
}

/// One record in a feed file. Only `text` or `title` is required.
#[derive(Deserialize)]
struct JsonRecord {
    content_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    text: Option<String>,
    link: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

/// Reads items from JSON files on disk.
///
/// `path` holds the current batch. `historical_dir` holds one
/// `YYYY-MM-DD.json` file per day; a missing day is an empty batch.
struct JsonFileSource {
    name: String,
    path: Option<PathBuf>,
    historical_dir: Option<PathBuf>,
    kind: String,
}

impl JsonFileSource {
    async fn read(&self, path: &Path, fallback_ts: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NewsloomError::source(&self.name, format!("{}: {e}", path.display())))?;
        let records: Vec<JsonRecord> = serde_json::from_str(&raw).map_err(|e| {
            NewsloomError::source(&self.name, format!("invalid JSON in {}: {e}", path.display()))
        })?;

        let items = records
            .into_iter()
            .map(|r| {
                let body = r.text.clone().or_else(|| r.title.clone()).unwrap_or_default();
                let content_id = r.content_id.or_else(|| {
                    (!body.is_empty()).then(|| {
                        ContentItem::derive_content_id(&self.name, r.link.as_deref(), &body)
                    })
                });
                ContentItem {
                    content_id,
                    source: self.name.clone(),
                    kind: r.kind.unwrap_or_else(|| self.kind.clone()),
                    title: r.title,
                    text: r.text,
                    link: r.link,
                    timestamp: r.timestamp.unwrap_or(fallback_ts),
                    metadata: r.metadata,
                }
            })
            .collect::<Vec<_>>();

        debug!(source = %self.name, path = %path.display(), items = items.len(), "read feed file");
        Ok(items)
    }
}

#[async_trait]
impl Source for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_items(&self) -> Result<Vec<ContentItem>> {
        match &self.path {
            Some(path) => self.read(path, Utc::now()).await,
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl HistoricalSource for JsonFileSource {
    async fn fetch_historical(&self, date: NaiveDate) -> Result<Vec<ContentItem>> {
        let Some(dir) = &self.historical_dir else {
            return Ok(Vec::new());
        };
        let path = dir.join(format!("{date}.json"));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(source = %self.name, %date, "no archive file for date");
            return Ok(Vec::new());
        }
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        self.read(&path, midnight).await
    }
}

// ---------------------------------------------------------------------------
// keyword-tags enricher
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct KeywordParams {
    /// Topic name → keywords that mark an item as belonging to it.
    topics: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_field")]
    field: String,
}

fn default_field() -> String {
    "topics".into()
}

/// Adds matched topic names to `metadata[field]`.
struct KeywordTagger {
    name: String,
    topics: Vec<(String, Vec<String>)>,
    field: String,
}

impl KeywordTagger {
    fn new(name: String, params: KeywordParams) -> Self {
        let topics = params
            .topics
            .into_iter()
            .map(|(topic, words)| (topic, words.into_iter().map(|w| w.to_lowercase()).collect()))
            .collect();
        Self {
            name,
            topics,
            field: params.field,
        }
    }

    fn matches(&self, item: &ContentItem) -> Vec<String> {
        let haystack = format!(
            "{} {}",
            item.title.as_deref().unwrap_or_default(),
            item.text.as_deref().unwrap_or_default()
        )
        .to_lowercase();

        self.topics
            .iter()
            .filter(|(_, words)| words.iter().any(|w| haystack.contains(w.as_str())))
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl Enricher for KeywordTagger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich(&self, mut items: Vec<ContentItem>) -> Result<Vec<ContentItem>> {
        for item in &mut items {
            let found = self.matches(item);
            if found.is_empty() {
                continue;
            }
            let entry = item
                .metadata
                .entry(self.field.clone())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(existing) = entry.as_array_mut() {
                for topic in found {
                    let value = serde_json::Value::String(topic);
                    if !existing.contains(&value) {
                        existing.push(value);
                    }
                }
            }
        }
        Ok(items)
    }
}
