use crate::error::IndexError;
use crate::models::{Chunk, RetrievedChunk, RetrievalResult, SourceSummary};
use crate::traits::{IndexRecord, VectorIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const INDEX_FORMAT: &str = "docqa-vector-index";
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// On-disk layout, version 1.
///
/// ```json
/// { "format": "docqa-vector-index", "schema_version": 1, "dimension": 128,
///   "next_sequence": 42, "updated_at": "...", "records": [ { "sequence": 0,
///   "chunk": { "id": "...", "text": "...", "source": "...", "page": 1,
///   "sequence_index": 0 }, "vector": [ ... ] } ] }
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    format: String,
    schema_version: u32,
    dimension: Option<usize>,
    next_sequence: u64,
    updated_at: DateTime<Utc>,
    records: Vec<StoredRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    /// Insertion order, used to break distance ties.
    sequence: u64,
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct IndexState {
    dimension: Option<usize>,
    next_sequence: u64,
    records: Vec<StoredRecord>,
}

impl IndexState {
    fn check_batch(&self, records: &[IndexRecord]) -> Result<Option<usize>, IndexError> {
        let mut dimension = self.dimension;
        let mut seen = HashSet::new();

        for record in records {
            if !seen.insert(record.chunk.id.as_str()) {
                return Err(IndexError::DuplicateId(record.chunk.id.clone()));
            }
            match dimension {
                Some(expected) if expected != record.vector.len() => {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        found: record.vector.len(),
                    });
                }
                Some(_) => {}
                None => dimension = Some(record.vector.len()),
            }
        }

        Ok(dimension)
    }

    fn apply(&mut self, records: Vec<IndexRecord>, dimension: Option<usize>) {
        self.dimension = dimension;

        let positions: HashMap<String, usize> = self
            .records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.chunk.id.clone(), position))
            .collect();

        for record in records {
            match positions.get(&record.chunk.id) {
                Some(&position) => {
                    let stored = &mut self.records[position];
                    stored.chunk = record.chunk;
                    stored.vector = record.vector;
                }
                None => {
                    self.records.push(StoredRecord {
                        sequence: self.next_sequence,
                        chunk: record.chunk,
                        vector: record.vector,
                    });
                    self.next_sequence += 1;
                }
            }
        }
    }

    fn to_file(&self) -> IndexFile {
        IndexFile {
            format: INDEX_FORMAT.to_string(),
            schema_version: INDEX_SCHEMA_VERSION,
            dimension: self.dimension,
            next_sequence: self.next_sequence,
            updated_at: Utc::now(),
            records: self.records.clone(),
        }
    }
}

/// Exact cosine-distance index held in memory and snapshotted to one JSON file.
///
/// Writers build the next state on a copy and swap it in only after the
/// snapshot is on disk, all under the write lock.
#[derive(Debug)]
pub struct JsonFileIndex {
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
}

impl JsonFileIndex {
    /// Opens an index file, or starts empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_index_file(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => IndexState::default(),
            Err(error) => return Err(IndexError::Io(error)),
        };

        info!(
            path = %path.display(),
            records = state.records.len(),
            dimension = ?state.dimension,
            "vector index opened"
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A non-persistent index.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    async fn persist(&self, state: &IndexState) -> Result<(), IndexError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(&state.to_file())?;
        let staging = staging_path(path);

        if let Err(error) = write_and_rename(&staging, path, &bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!(path = %staging.display(), error = %cleanup, "staging file not removed");
            }
            return Err(IndexError::Io(error));
        }
        sync_parent_dir(path).await?;

        debug!(path = %path.display(), records = state.records.len(), "vector index persisted");
        Ok(())
    }
}

async fn write_and_rename(staging: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(staging).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(staging, path).await
}

/// Makes the rename itself durable.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<(), IndexError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<(), IndexError> {
    Ok(())
}

#[async_trait]
impl VectorIndex for JsonFileIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        let mut guard = self.state.write().await;
        let dimension = guard.check_batch(&records)?;

        let mut next = guard.clone();
        next.apply(records, dimension);
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn replace_source(
        &self,
        source: &str,
        records: Vec<IndexRecord>,
    ) -> Result<(), IndexError> {
        let mut guard = self.state.write().await;
        let dimension = guard.check_batch(&records)?;

        let mut next = guard.clone();
        let before = next.records.len();
        {
            let keep: HashSet<&str> =
                records.iter().map(|record| record.chunk.id.as_str()).collect();
            next.records.retain(|stored| {
                stored.chunk.source != source || keep.contains(stored.chunk.id.as_str())
            });
        }
        let dropped = before - next.records.len();

        next.apply(records, dimension);
        self.persist(&next).await?;
        *guard = next;

        if dropped > 0 {
            debug!(source, dropped, "stale chunks removed");
        }
        Ok(())
    }

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<RetrievalResult, IndexError> {
        let guard = self.state.read().await;
        if guard.records.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if let Some(expected) = guard.dimension {
            if expected != query_vector.len() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    found: query_vector.len(),
                });
            }
        }

        let mut scored: Vec<(f32, u64, &StoredRecord)> = guard
            .records
            .iter()
            .map(|record| {
                (
                    cosine_distance(query_vector, &record.vector),
                    record.sequence,
                    record,
                )
            })
            .collect();

        scored.sort_by(|left, right| left.0.total_cmp(&right.0).then(left.1.cmp(&right.1)));

        Ok(scored
            .into_iter()
            .take(k.min(guard.records.len()))
            .map(|(distance, _, record)| RetrievedChunk {
                chunk: record.chunk.clone(),
                relevance: distance_to_relevance(distance),
            })
            .collect())
    }

    async fn clear(&self) -> Result<(), IndexError> {
        let mut guard = self.state.write().await;
        let next = IndexState {
            next_sequence: guard.next_sequence,
            ..IndexState::default()
        };
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    async fn sources(&self) -> Vec<SourceSummary> {
        let guard = self.state.read().await;
        let mut counts = BTreeMap::<&str, usize>::new();
        for record in &guard.records {
            *counts.entry(record.chunk.source.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(source, chunks)| SourceSummary {
                source: source.to_string(),
                chunks,
            })
            .collect()
    }
}

/// `1 - cosine similarity`, in `[0, 2]`. A zero vector is treated as orthogonal to everything.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right.iter()).map(|(a, b)| a * b).sum();
    let norm_left: f32 = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let norm_right: f32 = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm_left == 0.0 || norm_right == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_left * norm_right)
}

/// Only valid for cosine distance.
pub fn distance_to_relevance(distance: f32) -> f32 {
    let relevance = 1.0 - distance;
    if relevance.is_nan() {
        0.0
    } else {
        relevance.clamp(0.0, 1.0)
    }
}

fn decode_index_file(bytes: &[u8]) -> Result<IndexState, IndexError> {
    let raw: Value = serde_json::from_slice(bytes)?;
    let format = raw.get("format").and_then(Value::as_str).unwrap_or_default();
    let version = raw.get("schema_version").and_then(Value::as_u64);

    if format != INDEX_FORMAT || version != Some(u64::from(INDEX_SCHEMA_VERSION)) {
        return Err(IndexError::UnsupportedSchema {
            found: format!(
                "{} v{}",
                if format.is_empty() { "<unknown>" } else { format },
                version.map(|value| value.to_string()).unwrap_or_else(|| "?".to_string())
            ),
            supported: format!("{INDEX_FORMAT} v{INDEX_SCHEMA_VERSION}"),
        });
    }

    let file: IndexFile = serde_json::from_value(raw)?;
    Ok(IndexState {
        dimension: file.dimension,
        next_sequence: file.next_sequence,
        records: file.records,
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, source: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord::new(
            Chunk {
                id: id.to_string(),
                text: format!("text of {id}"),
                source: source.to_string(),
                page: 1,
                sequence_index: 0,
            },
            vector,
        )
    }

    #[tokio::test]
    async fn search_on_empty_index_fails() {
        let index = JsonFileIndex::in_memory();
        let result = index.search(&[1.0, 0.0], 3).await;
        assert!(matches!(result, Err(IndexError::EmptyIndex)));
    }

    #[tokio::test]
    async fn dimension_is_fixed_by_first_record() {
        let index = JsonFileIndex::in_memory();
        index
            .upsert(vec![record("a", "doc", vec![1.0, 0.0, 0.0])])
            .await
            .expect("first insert");

        let result = index.upsert(vec![record("b", "doc", vec![1.0, 0.0])]).await;
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn mismatched_batch_is_not_partially_applied() {
        let index = JsonFileIndex::in_memory();
        let result = index
            .upsert(vec![
                record("a", "doc", vec![1.0, 0.0]),
                record("b", "doc", vec![1.0, 0.0, 0.0]),
            ])
            .await;

        assert!(result.is_err());
        assert!(index.is_empty().await);
        assert_eq!(index.dimension().await, None);
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_batch_are_rejected() {
        let index = JsonFileIndex::in_memory();
        let result = index
            .upsert(vec![
                record("a", "doc", vec![1.0, 0.0]),
                record("a", "doc", vec![0.0, 1.0]),
            ])
            .await;
        assert!(matches!(result, Err(IndexError::DuplicateId(id)) if id == "a"));
    }

    #[tokio::test]
    async fn identical_vector_ranks_first_with_full_relevance() {
        let index = JsonFileIndex::in_memory();
        index
            .upsert(vec![
                record("a", "doc", vec![0.2, 0.9, 0.1]),
                record("b", "doc", vec![0.9, 0.1, 0.3]),
                record("c", "doc", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .expect("insert");

        let hits = index.search(&[0.9, 0.1, 0.3], 2).await.expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "b");
        assert!((hits[0].relevance - 1.0).abs() < 1e-5);
        assert!(hits[0].relevance >= hits[1].relevance);
    }

    #[tokio::test]
    async fn k_is_clamped_and_ties_follow_insertion_order() {
        let index = JsonFileIndex::in_memory();
        index
            .upsert(vec![
                record("first", "doc", vec![1.0, 0.0]),
                record("second", "doc", vec![2.0, 0.0]),
                record("third", "doc", vec![3.0, 0.0]),
            ])
            .await
            .expect("insert");

        for _ in 0..3 {
            let hits = index.search(&[1.0, 0.0], 50).await.expect("search");
            let ids: Vec<_> = hits.iter().map(|hit| hit.chunk.id.as_str()).collect();
            assert_eq!(ids, vec!["first", "second", "third"]);
        }
    }

    #[tokio::test]
    async fn overwriting_an_id_keeps_count_and_position() {
        let index = JsonFileIndex::in_memory();
        index
            .upsert(vec![record("a", "doc", vec![1.0, 0.0]), record("b", "doc", vec![1.0, 0.0])])
            .await
            .expect("insert");
        index
            .upsert(vec![record("a", "doc", vec![1.0, 0.0])])
            .await
            .expect("overwrite");

        assert_eq!(index.len().await, 2);
        let hits = index.search(&[1.0, 0.0], 2).await.expect("search");
        assert_eq!(hits[0].chunk.id, "a");
    }

    #[tokio::test]
    async fn replace_source_drops_stale_chunks_of_that_source_only() {
        let index = JsonFileIndex::in_memory();
        index
            .upsert(vec![
                record("a0", "a.pdf", vec![1.0, 0.0]),
                record("a1", "a.pdf", vec![1.0, 0.0]),
                record("b0", "b.pdf", vec![0.0, 1.0]),
            ])
            .await
            .expect("insert");

        index
            .replace_source("a.pdf", vec![record("a0", "a.pdf", vec![1.0, 0.0])])
            .await
            .expect("replace");

        let sources = index.sources().await;
        assert_eq!(
            sources,
            vec![
                SourceSummary {
                    source: "a.pdf".to_string(),
                    chunks: 1
                },
                SourceSummary {
                    source: "b.pdf".to_string(),
                    chunks: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_staging_file_and_no_change(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");
        let index = JsonFileIndex::open(&path).await?;
        // a directory in the way makes the final rename fail
        std::fs::create_dir(&path)?;

        let result = index.upsert(vec![record("a", "doc", vec![1.0, 0.0])]).await;

        assert!(matches!(result, Err(IndexError::Io(_))));
        assert!(!staging_path(&path).exists());
        assert!(index.is_empty().await);
        assert_eq!(index.dimension().await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_see_whole_batches_only() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = std::sync::Arc::new(JsonFileIndex::open(dir.path().join("index.json")).await?);
        index.upsert(vec![record("seed", "doc", vec![1.0, 0.0])]).await?;

        for round in 0..20 {
            let batch: Vec<IndexRecord> = (0..3)
                .map(|offset| record(&format!("r{round}-{offset}"), "doc", vec![0.5, 0.5]))
                .collect();
            let before = index.len().await;

            let writer = {
                let index = std::sync::Arc::clone(&index);
                tokio::spawn(async move { index.upsert(batch).await })
            };
            let seen = index.search(&[1.0, 0.0], usize::MAX).await?.len();
            writer.await??;

            assert!(
                seen == before || seen == before + 3,
                "reader saw {seen} records, expected {before} or {}",
                before + 3
            );
            assert_eq!(index.len().await, before + 3);
        }
        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopen_and_clear_is_durable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("index.json");

        {
            let index = JsonFileIndex::open(&path).await?;
            index
                .upsert(vec![record("a", "doc", vec![0.5, 0.5]), record("b", "doc", vec![1.0, 0.0])])
                .await?;
        }

        let reopened = JsonFileIndex::open(&path).await?;
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.dimension().await, Some(2));
        let hits = reopened.search(&[1.0, 0.0], 1).await?;
        assert_eq!(hits[0].chunk.id, "b");

        reopened.clear().await?;
        let cleared = JsonFileIndex::open(&path).await?;
        assert!(cleared.is_empty().await);
        assert_eq!(cleared.dimension().await, None);
        assert!(!staging_path(&path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_schema_version_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");
        std::fs::write(
            &path,
            r#"{"format":"docqa-vector-index","schema_version":99,"records":[]}"#,
        )?;

        let result = JsonFileIndex::open(&path).await;
        assert!(matches!(result, Err(IndexError::UnsupportedSchema { .. })));

        std::fs::write(&path, r#"{"something":"else"}"#)?;
        let result = JsonFileIndex::open(&path).await;
        assert!(matches!(result, Err(IndexError::UnsupportedSchema { .. })));
        Ok(())
    }

    #[test]
    fn relevance_is_clamped_to_unit_interval() {
        assert_eq!(distance_to_relevance(0.0), 1.0);
        assert_eq!(distance_to_relevance(1.5), 0.0);
        assert_eq!(distance_to_relevance(f32::NAN), 0.0);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }
}
