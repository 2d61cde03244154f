//! LanceDB Snapshot Store - 카테고리별 스냅샷 영속화
//!
//! 디렉토리 구조:
//! ```text
//! <index_root>/<category key>/
//!     gen_<uuid>.lance/     세대별 테이블
//!     manifest.json         현재 세대 포인터
//! ```
//!
//! 새 세대 테이블을 먼저 쓰고, manifest를 임시 파일로 쓴 뒤 rename으로
//! 교체합니다. 직전 세대보다 오래된 테이블은 manifest 교체 후에만 삭제합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use ignore::WalkBuilder;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::KnowledgeError;

use super::category::Category;
use super::chunker::{Chunk, SourceRef};
use super::snapshot::{ChunkId, IndexEntry, IndexSnapshot};

const MANIFEST_FILE: &str = "manifest.json";

// ============================================================================
// Manifest
// ============================================================================

/// 카테고리별 현재 세대 포인터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// 이 카테고리를 기록한 스냅샷 세대
    pub generation: Uuid,
    /// 현재 테이블 이름
    pub table: String,
    /// 기록 시각 (카테고리 갱신 시각)
    pub timestamp: DateTime<Utc>,
    pub entry_count: usize,
    pub dimension: usize,
}

// ============================================================================
// SnapshotStore
// ============================================================================

/// LanceDB 기반 스냅샷 저장소
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.key())
    }

    /// 현재 manifest 읽기 (없으면 None)
    pub async fn manifest(&self, category: Category) -> std::result::Result<Option<Manifest>, KnowledgeError> {
        let path = self.category_dir(category).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| corrupt(&path, format!("unreadable manifest: {}", e)))?;
        let manifest = serde_json::from_str(&raw)
            .map_err(|e| corrupt(&path, format!("invalid manifest: {}", e)))?;
        Ok(Some(manifest))
    }

    /// 지정 카테고리를 스냅샷 내용으로 기록
    ///
    /// 카테고리 단위로 원자적입니다.
    pub async fn persist(&self, snapshot: &IndexSnapshot, categories: &BTreeSet<Category>) -> Result<()> {
        for category in categories {
            self.persist_category(snapshot, *category)
                .await
                .with_context(|| format!("Failed to persist category {}", category))?;
        }
        Ok(())
    }

    async fn persist_category(&self, snapshot: &IndexSnapshot, category: Category) -> Result<()> {
        let dir = self.category_dir(category);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create index directory {:?}", dir))?;

        let previous = self.manifest(category).await.ok().flatten();
        let entries = snapshot.entries_for(category);
        let dimension = entries
            .first()
            .map(|e| e.embedding.len())
            .unwrap_or_else(|| snapshot.dimension());
        let table_name = format!("gen_{}", Uuid::new_v4().simple());

        let db = connect(&dir).await?;
        let schema = Arc::new(create_schema(dimension));
        if entries.is_empty() {
            db.create_empty_table(&table_name, schema)
                .execute()
                .await
                .context("Failed to create empty table")?;
        } else {
            let batch = entries_to_batch(&entries, schema.clone(), dimension)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            db.create_table(&table_name, batches)
                .execute()
                .await
                .context("Failed to create table")?;
        }

        // manifest가 가리키기 전에 테이블 파일을 디스크에 확정
        let table_dir = dir.join(format!("{}.lance", table_name));
        tokio::task::spawn_blocking(move || sync_tree(&table_dir))
            .await
            .context("Table sync task failed")??;

        let manifest = Manifest {
            generation: snapshot.generation(),
            table: table_name.clone(),
            timestamp: snapshot
                .refreshed_at()
                .get(&category)
                .copied()
                .unwrap_or_else(Utc::now),
            entry_count: entries.len(),
            dimension,
        };
        write_manifest(&dir, &manifest).await?;

        tracing::debug!(
            "Persisted {} ({} entries, table {})",
            category,
            entries.len(),
            table_name
        );

        // 현재와 직전 세대만 남김
        let mut keep = vec![table_name];
        if let Some(prev) = previous {
            keep.push(prev.table);
        }
        let names = db
            .table_names()
            .execute()
            .await
            .context("Failed to list tables")?;
        for stale in names.into_iter().filter(|n| !keep.contains(n)) {
            if let Err(e) = db.drop_table(&stale).await {
                tracing::warn!("Failed to drop stale table {} for {}: {}", stale, category, e);
            }
        }

        Ok(())
    }

    /// 영속화된 카테고리들로 스냅샷 복원
    ///
    /// manifest가 하나도 없으면 `Ok(None)` (한 번도 빌드되지 않음).
    pub async fn load(&self, categories: &[Category]) -> std::result::Result<Option<IndexSnapshot>, KnowledgeError> {
        let mut entries = Vec::new();
        let mut refreshed_at = BTreeMap::new();
        let mut dimension: Option<usize> = None;
        let mut found = false;

        for &category in categories {
            let Some(manifest) = self.manifest(category).await? else {
                continue;
            };
            found = true;

            let dir = self.category_dir(category);
            if manifest.entry_count > 0 {
                match dimension {
                    Some(d) if d != manifest.dimension => {
                        return Err(corrupt(
                            &dir,
                            format!("dimension {} differs from {}", manifest.dimension, d),
                        ));
                    }
                    _ => dimension = Some(manifest.dimension),
                }

                let rows = read_table(&dir, &manifest, category)
                    .await
                    .map_err(|e| corrupt(&dir, format!("{:#}", e)))?;
                if rows.len() != manifest.entry_count {
                    return Err(corrupt(
                        &dir,
                        format!("expected {} rows, found {}", manifest.entry_count, rows.len()),
                    ));
                }
                entries.extend(rows);
            }
            refreshed_at.insert(category, manifest.timestamp);
        }

        if !found {
            return Ok(None);
        }

        let snapshot = IndexSnapshot::assemble(Uuid::new_v4(), entries, refreshed_at)
            .map_err(|e| corrupt(&self.root, e.to_string()))?;
        tracing::info!(
            "Loaded index snapshot: {} entries across {} categories",
            snapshot.len(),
            snapshot.refreshed_at().len()
        );
        Ok(Some(snapshot))
    }
}

fn corrupt(path: &Path, reason: String) -> KnowledgeError {
    KnowledgeError::IndexCorrupt {
        path: path.to_path_buf(),
        reason,
    }
}

async fn connect(dir: &Path) -> Result<Connection> {
    let path_str = dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

    lancedb::connect(path_str)
        .execute()
        .await
        .context("Failed to connect to LanceDB")
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    let body = serde_json::to_vec_pretty(manifest).context("Failed to serialize manifest")?;

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .context("Failed to create manifest")?;
    file.write_all(&body).await.context("Failed to write manifest")?;
    file.sync_all().await.context("Failed to sync manifest")?;
    drop(file);

    tokio::fs::rename(&tmp, dir.join(MANIFEST_FILE))
        .await
        .context("Failed to swap manifest")?;
    sync_dir(dir);
    Ok(())
}

/// 테이블 디렉토리 아래 모든 파일을 디스크에 동기화
fn sync_tree(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkBuilder::new(root).standard_filters(false).build() {
        let entry = entry.context("Failed to walk table directory")?;
        if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            std::fs::File::open(entry.path())
                .and_then(|f| f.sync_all())
                .with_context(|| format!("Failed to sync {:?}", entry.path()))?;
        } else {
            sync_dir(entry.path());
        }
    }
    Ok(())
}

/// 디렉토리 엔트리 동기화 (지원하지 않는 플랫폼이면 건너뜀)
fn sync_dir(dir: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Err(e) = std::fs::File::open(dir).and_then(|f| f.sync_all()) {
        tracing::debug!("Failed to sync directory {:?}: {}", dir, e);
    }
}

// ============================================================================
// Arrow Conversion
// ============================================================================

/// 스냅샷 테이블 스키마
fn create_schema(dimension: usize) -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("position", DataType::Int64, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("origin", DataType::Utf8, false),
        Field::new("ordinal", DataType::Int64, false),
        Field::new("chunk_index", DataType::Int64, false),
        Field::new("overlap", DataType::Int64, false),
        Field::new("acquired_at", DataType::Int64, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ),
    ])
}

/// 엔트리들을 Arrow RecordBatch로 변환
fn entries_to_batch(entries: &[IndexEntry], schema: SchemaRef, dimension: usize) -> Result<RecordBatch> {
    if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
        anyhow::bail!(
            "Entry {} has dimension {}, expected {}",
            bad.id,
            bad.embedding.len(),
            dimension
        );
    }

    let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    let positions: Vec<i64> = (0..entries.len() as i64).collect();
    let contents: Vec<&str> = entries.iter().map(|e| e.chunk.content.as_str()).collect();
    let categories: Vec<String> = entries.iter().map(|e| e.chunk.category.key()).collect();
    let origins: Vec<&str> = entries
        .iter()
        .map(|e| e.chunk.source.origin_url.as_str())
        .collect();
    let ordinals: Vec<i64> = entries.iter().map(|e| e.chunk.source.ordinal as i64).collect();
    let chunk_indices: Vec<i64> = entries.iter().map(|e| e.chunk.chunk_index as i64).collect();
    let overlaps: Vec<i64> = entries
        .iter()
        .map(|e| e.chunk.overlap_with_predecessor as i64)
        .collect();
    let acquired: Vec<i64> = entries
        .iter()
        .map(|e| e.chunk.acquired_at.timestamp_millis())
        .collect();

    let embeddings_flat: Vec<f32> = entries
        .iter()
        .flat_map(|e| e.embedding.iter().copied())
        .collect();
    let values = Float32Array::from(embeddings_flat);
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let embeddings_list = FixedSizeListArray::try_new(
        field,
        dimension as i32,
        Arc::new(values) as Arc<dyn Array>,
        None,
    )
    .context("Failed to create embedding array")?;

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(Int64Array::from(positions)),
            Arc::new(StringArray::from(contents)),
            Arc::new(StringArray::from(categories)),
            Arc::new(StringArray::from(origins)),
            Arc::new(Int64Array::from(ordinals)),
            Arc::new(Int64Array::from(chunk_indices)),
            Arc::new(Int64Array::from(overlaps)),
            Arc::new(Int64Array::from(acquired)),
            Arc::new(embeddings_list),
        ],
    )
    .context("Failed to create RecordBatch")
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

/// 현재 세대 테이블의 모든 행 읽기 (position 순)
async fn read_table(dir: &Path, manifest: &Manifest, category: Category) -> Result<Vec<IndexEntry>> {
    let db = connect(dir).await?;
    let table = db
        .open_table(&manifest.table)
        .execute()
        .await
        .with_context(|| format!("Failed to open table {}", manifest.table))?;

    let stream = table
        .query()
        .limit(manifest.entry_count)
        .execute()
        .await
        .context("Failed to scan table")?;
    let batches: Vec<RecordBatch> = stream.try_collect().await?;

    let mut rows: Vec<(i64, IndexEntry)> = Vec::with_capacity(manifest.entry_count);
    for batch in batches {
        let ids = column::<StringArray>(&batch, "id")?;
        let positions = column::<Int64Array>(&batch, "position")?;
        let contents = column::<StringArray>(&batch, "content")?;
        let categories = column::<StringArray>(&batch, "category")?;
        let origins = column::<StringArray>(&batch, "origin")?;
        let ordinals = column::<Int64Array>(&batch, "ordinal")?;
        let chunk_indices = column::<Int64Array>(&batch, "chunk_index")?;
        let overlaps = column::<Int64Array>(&batch, "overlap")?;
        let acquired = column::<Int64Array>(&batch, "acquired_at")?;
        let embeddings = column::<FixedSizeListArray>(&batch, "embedding")?;

        for i in 0..batch.num_rows() {
            let stored: Category = categories
                .value(i)
                .parse()
                .map_err(|e| anyhow::anyhow!("Row {}: {}", i, e))?;
            if stored != category {
                anyhow::bail!("Row {} belongs to {}, not {}", i, stored, category);
            }

            let vector_ref = embeddings.value(i);
            let vector = vector_ref
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| anyhow::anyhow!("Row {}: embedding is not float32", i))?;
            if vector.len() != manifest.dimension {
                anyhow::bail!("Row {}: dimension {} != {}", i, vector.len(), manifest.dimension);
            }

            let acquired_at = DateTime::from_timestamp_millis(acquired.value(i))
                .ok_or_else(|| anyhow::anyhow!("Row {}: invalid timestamp", i))?;

            rows.push((
                positions.value(i),
                IndexEntry {
                    id: ChunkId::from_hex(ids.value(i)),
                    chunk: Chunk {
                        content: contents.value(i).to_string(),
                        overlap_with_predecessor: overlaps.value(i).max(0) as usize,
                        source: SourceRef {
                            origin_url: origins.value(i).to_string(),
                            ordinal: ordinals.value(i).max(0) as usize,
                        },
                        chunk_index: chunk_indices.value(i).max(0) as usize,
                        category,
                        acquired_at,
                    },
                    embedding: Arc::from(vector.values().to_vec()),
                },
            ));
        }
    }

    rows.sort_by_key(|(position, _)| *position);
    Ok(rows.into_iter().map(|(_, entry)| entry).collect())
}

// ============================================================================
// Tests
// ============================================================================
