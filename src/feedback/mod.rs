use crate::config::FeedbackConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub session_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackFilter {
    pub tool_name: Option<String>,
    pub tag: Option<String>,
}

impl FeedbackFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tool(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tag: None,
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tool_name: None,
            tag: Some(tag.into()),
        }
    }

    fn matches(&self, record: &FeedbackRecord) -> bool {
        let tool_ok = self
            .tool_name
            .as_deref()
            .is_none_or(|tool| record.tool_name.as_deref() == Some(tool));
        let tag_ok = self
            .tag
            .as_deref()
            .is_none_or(|tag| record.tags.iter().any(|t| t == tag));
        tool_ok && tag_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub count: usize,
    /// Mean rating; `0.0` when nothing matched.
    pub average: f64,
}

/// Collects user ratings. Entirely separate from engine state; a journal
/// write failure is logged and the record is still kept in memory.
pub struct FeedbackRecorder {
    session_id: String,
    min_rating: u8,
    max_rating: u8,
    journal: Option<PathBuf>,
    records: Mutex<Vec<FeedbackRecord>>,
}

impl FeedbackRecorder {
    pub fn new(config: &FeedbackConfig, session_id: impl Into<String>) -> Self {
        let journal = config.resolved_journal_path();
        let records = journal.as_deref().map(load_journal).unwrap_or_default();
        Self {
            session_id: session_id.into(),
            min_rating: config.min_rating,
            max_rating: config.max_rating,
            journal,
            records: Mutex::new(records),
        }
    }

    pub fn submit(
        &self,
        rating: i64,
        comment: Option<String>,
        tool_name: Option<String>,
        tags: Vec<String>,
    ) -> FeedbackRecord {
        let clamped = rating.clamp(i64::from(self.min_rating), i64::from(self.max_rating));
        if clamped != rating {
            tracing::warn!(rating, clamped, "feedback rating outside scale, clamped");
        }
        let record = FeedbackRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            rating: u8::try_from(clamped).unwrap_or(self.max_rating),
            comment: comment.filter(|c| !c.trim().is_empty()),
            tool_name,
            tags,
            created_at: Utc::now(),
        };

        if let Some(path) = &self.journal
            && let Err(error) = append_journal(path, &record)
        {
            tracing::warn!(path = %path.display(), error = %error, "failed to append feedback journal");
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    pub fn summary(&self, filter: &FeedbackFilter) -> FeedbackSummary {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, total) = records
            .iter()
            .filter(|record| filter.matches(record))
            .fold((0usize, 0u64), |(count, total), record| {
                (count + 1, total + u64::from(record.rating))
            });
        #[allow(clippy::cast_precision_loss)]
        let average = if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        };
        FeedbackSummary { count, average }
    }

    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn append_journal(path: &Path, record: &FeedbackRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(record)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Read every parseable line of the journal. Corrupt lines are skipped.
fn load_journal(path: &Path) -> Vec<FeedbackRecord> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "skipping corrupt feedback line");
                None
            }
        })
        .collect()
}
