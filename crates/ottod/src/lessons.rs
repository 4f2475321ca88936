//! Failure and lesson memory.
//!
//! SQLite-backed store of facts and negative constraints derived from
//! past outcomes. Upserts are idempotent: the row key is a hash of the
//! normalized trigger and fact, and duplicate saves bump `access_count`
//! instead of creating new rows.
//!
//! The similarity function behind `get_relevant` is pluggable; the
//! default is a lexical token-overlap scorer.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use otto_common::error::KernelError;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Minimum similarity for a record to count as relevant.
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// A fact worth recalling.
    Positive,
    /// A constraint: something that failed before and should be avoided.
    Negative,
}

impl Polarity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "negative" => Self::Negative,
            _ => Self::Positive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonRecord {
    pub id: String,
    pub trigger: String,
    pub fact: String,
    pub polarity: Polarity,
    pub source: String,
    pub reliability: f64,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Pluggable similarity behind `get_relevant`.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, record: &LessonRecord) -> f64;
}

/// Token-overlap scorer: share of query tokens (length > 3) that appear
/// in the record's trigger or fact.
pub struct LexicalScorer;

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(|t| t.to_string())
        .collect()
}

impl RelevanceScorer for LexicalScorer {
    fn score(&self, query: &str, record: &LessonRecord) -> f64 {
        let query_tokens = tokens(query);
        if query_tokens.is_empty() {
            return 0.0;
        }
        let record_tokens = tokens(&format!("{} {}", record.trigger, record.fact));
        let overlap = query_tokens.intersection(&record_tokens).count();
        overlap as f64 / query_tokens.len() as f64
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable upsert key for a trigger+fact pair.
fn lesson_id(trigger: &str, fact: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(trigger).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(fact).as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub struct LessonStore {
    conn: Arc<Mutex<Connection>>,
    scorer: Box<dyn RelevanceScorer>,
    confidence_floor: f64,
}

impl LessonStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open lesson store: {:?}", path))?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            scorer: Box::new(LexicalScorer),
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn with_scorer(mut self, scorer: Box<dyn RelevanceScorer>, floor: f64) -> Self {
        self.scorer = scorer;
        self.confidence_floor = floor;
        self
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS lessons (
                id TEXT PRIMARY KEY,
                trigger_text TEXT NOT NULL,
                fact TEXT NOT NULL,
                polarity TEXT NOT NULL,
                source TEXT NOT NULL,
                reliability REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lessons_accessed ON lessons(last_accessed)",
            [],
        )?;
        Ok(())
    }

    /// Idempotent upsert. A duplicate trigger+fact bumps `access_count`.
    pub fn save(
        &self,
        trigger: &str,
        fact: &str,
        polarity: Polarity,
        source: &str,
    ) -> Result<(), KernelError> {
        let id = lesson_id(trigger, fact);
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO lessons
                (id, trigger_text, fact, polarity, source, reliability,
                 access_count, created_at, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                access_count = access_count + 1,
                last_accessed = excluded.last_accessed
            "#,
            params![id, trigger, fact, polarity.as_str(), source, 0.8, now],
        )
        .map_err(|e| KernelError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Top-k records by similarity above the confidence floor,
    /// deduplicated by fact. Negative records carry their polarity so
    /// callers can present them as constraints rather than facts.
    pub fn get_relevant(&self, query: &str, k: usize) -> Result<Vec<LessonRecord>, KernelError> {
        let records = self.load_all()?;
        let mut scored: Vec<(f64, LessonRecord)> = records
            .into_iter()
            .filter_map(|record| {
                let score = self.scorer.score(query, &record);
                (score >= self.confidence_floor).then_some((score, record))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // On equal similarity, constraints outrank facts.
                    let a_neg = a.1.polarity == Polarity::Negative;
                    let b_neg = b.1.polarity == Polarity::Negative;
                    b_neg.cmp(&a_neg)
                })
        });

        let mut seen_facts = HashSet::new();
        let mut result = Vec::new();
        for (_, record) in scored {
            if seen_facts.insert(normalize(&record.fact)) {
                result.push(record);
                if result.len() == k {
                    break;
                }
            }
        }
        self.touch(&result)?;
        Ok(result)
    }

    fn touch(&self, records: &[LessonRecord]) -> Result<(), KernelError> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        for record in records {
            conn.execute(
                "UPDATE lessons SET last_accessed = ?1 WHERE id = ?2",
                params![now, record.id],
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    /// Deterministic ordered export for external tooling: creation
    /// order, id as tie-break.
    pub fn export(&self, filter: Option<Polarity>) -> Result<Vec<LessonRecord>, KernelError> {
        let mut records = self.load_all()?;
        if let Some(polarity) = filter {
            records.retain(|record| record.polarity == polarity);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn load_all(&self) -> Result<Vec<LessonRecord>, KernelError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, trigger_text, fact, polarity, source, reliability,
                        access_count, created_at, last_accessed
                 FROM lessons",
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LessonRecord {
                    id: row.get(0)?,
                    trigger: row.get(1)?,
                    fact: row.get(2)?,
                    polarity: Polarity::parse(&row.get::<_, String>(3)?),
                    source: row.get(4)?,
                    reliability: row.get(5)?,
                    access_count: row.get(6)?,
                    created_at: row.get(7)?,
                    last_accessed: row.get(8)?,
                })
            })
            .map_err(|e| KernelError::Persistence(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KernelError::Persistence(e.to_string()))
    }

    pub fn access_count(&self, trigger: &str, fact: &str) -> Result<Option<u32>, KernelError> {
        let id = lesson_id(trigger, fact);
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT access_count FROM lessons WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(KernelError::Persistence(other.to_string())),
        })
    }

    pub fn count(&self) -> Result<u64, KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM lessons", [], |row| row.get(0))
            .map_err(|e| KernelError::Persistence(e.to_string()))
    }

    /// Remove single-access records not touched within `days`.
    pub fn prune(&self, days: i64) -> Result<usize, KernelError> {
        let cutoff = Utc::now() - Duration::days(days);
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM lessons WHERE last_accessed < ?1 AND access_count <= 1",
                params![cutoff],
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))?;
        if removed > 0 {
            info!("Pruned {} stale lessons", removed);
        }
        Ok(removed)
    }
}

impl crate::flush::FlushTarget for LessonStore {
    fn name(&self) -> &'static str {
        "lessons"
    }

    fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // In-memory stores (tests) have no WAL to checkpoint.
        let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        Ok(())
    }
}
