//! C8: Memory Indexer — periodic SHA-256-keyed incremental indexing of a
//! markdown memory tree.
//!
//! Every tick, walks the configured directory depth-first, hashes each
//! `.md` file, and compares against the stored hash in `memory_chunks`. A
//! mismatch (or no stored hash) emits an [`IndexEvent::Chunk`]; a
//! previously-indexed file no longer observed on disk emits
//! [`IndexEvent::Deleted`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::{DbError, Store};

/// A single observed change during an indexing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A file was indexed for the first time or its content changed.
    Chunk {
        /// Path relative to the memory root.
        filepath: String,
        /// Full file content.
        content: String,
        /// Hex-encoded SHA-256 of the content.
        sha256: String,
    },
    /// A previously-indexed file is no longer present on disk.
    Deleted {
        /// Path relative to the memory root, as previously recorded.
        filepath: String,
    },
}

/// Errors raised while indexing.
#[derive(Debug, thiserror::Error)]
pub enum MemoryIndexerError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Running totals surfaced for observability.
#[derive(Debug, Default)]
pub struct IndexerStats {
    indexed_total: AtomicU64,
    indexed_last: AtomicU64,
    deleted_total: AtomicU64,
    last_index_time: Mutex<Option<DateTime<Utc>>>,
}

impl IndexerStats {
    /// Files indexed (created or changed) across all passes.
    pub fn indexed_total(&self) -> u64 {
        self.indexed_total.load(Ordering::Relaxed)
    }

    /// Files indexed during the most recent pass.
    pub fn indexed_last(&self) -> u64 {
        self.indexed_last.load(Ordering::Relaxed)
    }

    /// Files deleted across all passes.
    pub fn deleted_total(&self) -> u64 {
        self.deleted_total.load(Ordering::Relaxed)
    }

    /// When the most recent pass completed.
    pub fn last_index_time(&self) -> Option<DateTime<Utc>> {
        *self.last_index_time.lock().expect("stats lock")
    }
}

/// Walks a directory tree of markdown files and keeps `memory_chunks` in
/// sync with their content hashes.
pub struct MemoryIndexer {
    store: Arc<Store>,
    team_id: String,
    root: PathBuf,
    stats: IndexerStats,
}

impl MemoryIndexer {
    /// Build an indexer scoped to `team_id`'s memory tree rooted at `root`.
    pub fn new(store: Arc<Store>, team_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            team_id: team_id.into(),
            root: root.into(),
            stats: IndexerStats::default(),
        }
    }

    /// Running statistics for this indexer.
    pub fn stats(&self) -> &IndexerStats {
        &self.stats
    }

    /// Clear all stored hashes for this team so the next pass reindexes
    /// everything from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryIndexerError`] on storage failure.
    pub fn force_reindex(&self) -> Result<(), MemoryIndexerError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM memory_chunks WHERE team_id = ?1",
                rusqlite::params![self.team_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Run one indexing pass, returning every [`IndexEvent`] observed and
    /// persisting the updated hash table.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryIndexerError`] on storage or filesystem failure that
    /// prevents reading the stored hash table (individual unreadable files
    /// are skipped with a warning, not fatal).
    pub fn run_pass(&self) -> Result<Vec<IndexEvent>, MemoryIndexerError> {
        let stored = self.load_stored_hashes()?;
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        if self.root.is_dir() {
            self.walk(&self.root, &stored, &mut seen, &mut events);
        }

        for filepath in stored.keys() {
            if !seen.contains(filepath) {
                events.push(IndexEvent::Deleted {
                    filepath: filepath.clone(),
                });
            }
        }

        self.apply(&events)?;

        let indexed_this_pass = u64::try_from(
            events.iter().filter(|e| matches!(e, IndexEvent::Chunk { .. })).count(),
        )
        .unwrap_or(u64::MAX);
        let deleted_this_pass = u64::try_from(
            events.iter().filter(|e| matches!(e, IndexEvent::Deleted { .. })).count(),
        )
        .unwrap_or(u64::MAX);
        self.stats.indexed_total.fetch_add(indexed_this_pass, Ordering::Relaxed);
        self.stats.indexed_last.store(indexed_this_pass, Ordering::Relaxed);
        self.stats.deleted_total.fetch_add(deleted_this_pass, Ordering::Relaxed);
        *self.stats.last_index_time.lock().expect("stats lock") = Some(Utc::now());

        Ok(events)
    }

    fn walk(
        &self,
        dir: &Path,
        stored: &std::collections::HashMap<String, String>,
        seen: &mut HashSet<String>,
        events: &mut Vec<IndexEvent>,
    ) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            warn!(dir = %dir.display(), "failed to read memory directory");
            return;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, stored, seen, events);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let filepath = relative.to_string_lossy().replace('\\', "/");

            let Ok(content) = std::fs::read_to_string(&path) else {
                warn!(file = %filepath, "failed to read memory file, skipping");
                continue;
            };
            let hash = hex::encode(Sha256::digest(content.as_bytes()));
            seen.insert(filepath.clone());

            if stored.get(&filepath) != Some(&hash) {
                events.push(IndexEvent::Chunk {
                    filepath,
                    content,
                    sha256: hash,
                });
            }
        }
    }

    fn load_stored_hashes(&self) -> Result<std::collections::HashMap<String, String>, MemoryIndexerError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT filepath, sha256 FROM memory_chunks WHERE team_id = ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![self.team_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().collect())
    }

    fn apply(&self, events: &[IndexEvent]) -> Result<(), MemoryIndexerError> {
        self.store.with_conn(|conn| {
            for event in events {
                match event {
                    IndexEvent::Chunk {
                        filepath,
                        content,
                        sha256,
                    } => {
                        conn.execute(
                            "INSERT INTO memory_chunks (filepath, team_id, content, sha256, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)
                             ON CONFLICT (filepath) DO UPDATE SET
                                content = excluded.content, sha256 = excluded.sha256",
                            rusqlite::params![filepath, self.team_id, content, sha256, Utc::now().to_rfc3339()],
                        )?;
                        debug!(filepath, "memory chunk indexed");
                    }
                    IndexEvent::Deleted { filepath } => {
                        conn.execute(
                            "DELETE FROM memory_chunks WHERE filepath = ?1 AND team_id = ?2",
                            rusqlite::params![filepath, self.team_id],
                        )?;
                        debug!(filepath, "memory chunk deleted");
                    }
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Spawn a background task that runs a pass every `interval`.
    pub fn spawn_ticker(self: Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_pass() {
                    warn!(error = %e, "memory indexing pass failed");
                }
            }
        })
    }
}
