//! Index Snapshot - 불변 dense + sparse 인덱스 쌍과 빌더
//!
//! 스냅샷은 교체될 뿐 제자리에서 수정되지 않습니다. 같은 엔트리 목록이
//! 두 인덱스를 모두 뒷받침하므로 위치(position)가 곧 공통 키입니다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::error::{KnowledgeError, Result};

use super::category::Category;
use super::chunker::Chunk;
use super::lexical::LexicalIndex;
use super::vector::VectorIndex;

// ============================================================================
// ChunkId
// ============================================================================

/// 청크 식별자 (카테고리, 원본, 청크 인덱스, 내용의 SHA-256 hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn compute(chunk: &Chunk) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(chunk.category.key().as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.source.origin_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.source.ordinal.to_le_bytes());
        hasher.update(chunk.chunk_index.to_le_bytes());
        hasher.update(chunk.content.as_bytes());

        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// 저장된 hex 문자열에서 복원
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// IndexEntry
// ============================================================================

/// 인덱스 엔트리 (청크 + ID + 임베딩)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: ChunkId,
    pub chunk: Chunk,
    pub embedding: Arc<[f32]>,
}

// ============================================================================
// IndexSnapshot
// ============================================================================

/// 불변 인덱스 스냅샷
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: Uuid,
    entries: Arc<[IndexEntry]>,
    vector: VectorIndex,
    lexical: LexicalIndex,
    refreshed_at: BTreeMap<Category, DateTime<Utc>>,
}

impl IndexSnapshot {
    /// 엔트리 목록에서 두 인덱스를 함께 구성
    pub fn assemble(
        generation: Uuid,
        entries: Vec<IndexEntry>,
        refreshed_at: BTreeMap<Category, DateTime<Utc>>,
    ) -> Result<Self> {
        let vector = VectorIndex::build(
            entries
                .iter()
                .map(|e| (e.id.clone(), Arc::clone(&e.embedding))),
        )?;
        let lexical = LexicalIndex::build(
            entries
                .iter()
                .map(|e| (e.id.clone(), e.chunk.content.as_str())),
        );

        Ok(Self {
            generation,
            entries: entries.into(),
            vector,
            lexical,
            refreshed_at,
        })
    }

    /// 빈 스냅샷
    pub fn empty() -> Self {
        Self {
            generation: Uuid::new_v4(),
            entries: Arc::from(Vec::new()),
            vector: VectorIndex::default(),
            lexical: LexicalIndex::default(),
            refreshed_at: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.vector.dimension()
    }

    pub fn vector(&self) -> &VectorIndex {
        &self.vector
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn refreshed_at(&self) -> &BTreeMap<Category, DateTime<Utc>> {
        &self.refreshed_at
    }

    /// 카테고리별 엔트리 수
    pub fn category_counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter() {
            *counts.entry(entry.chunk.category).or_insert(0) += 1;
        }
        counts
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.entries.iter().any(|e| e.chunk.category == category)
    }

    /// 특정 카테고리 엔트리 복사본
    pub fn entries_for(&self, category: Category) -> Vec<IndexEntry> {
        self.entries
            .iter()
            .filter(|e| e.chunk.category == category)
            .cloned()
            .collect()
    }
}

// ============================================================================
// IndexBuilder
// ============================================================================

/// 빌드 설정
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    pub batch_size: usize,
    pub embed_timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            embed_timeout: Duration::from_secs(60),
        }
    }
}

/// Dual Index Builder
///
/// 배치 하나라도 실패하거나 시간 초과되면 빌드 전체가 중단되고
/// 부분 결과는 버려집니다.
pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    config: BuildConfig,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: BuildConfig) -> Self {
        Self { embedder, config }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// 청크 목록으로 새 스냅샷 생성
    pub async fn build(&self, chunks: Vec<Chunk>) -> Result<IndexSnapshot> {
        self.replace_categories(None, &BTreeSet::new(), chunks).await
    }

    /// 기존 스냅샷에 청크 추가
    ///
    /// 빈 입력이면 같은 세대의 스냅샷을 그대로 돌려줍니다.
    /// 이미 있는 ChunkId는 건너뜁니다.
    pub async fn extend(&self, snapshot: &IndexSnapshot, chunks: Vec<Chunk>) -> Result<IndexSnapshot> {
        let known: BTreeSet<&ChunkId> = snapshot.entries.iter().map(|e| &e.id).collect();
        let mut seen = BTreeSet::new();
        let fresh: Vec<(ChunkId, Chunk)> = chunks
            .into_iter()
            .map(|c| (ChunkId::compute(&c), c))
            .filter(|(id, _)| !known.contains(id) && seen.insert(id.clone()))
            .collect();

        if fresh.is_empty() {
            return Ok(snapshot.clone());
        }

        let now = Utc::now();
        let mut refreshed_at = snapshot.refreshed_at.clone();
        for (_, chunk) in &fresh {
            refreshed_at.insert(chunk.category, now);
        }

        let mut entries = snapshot.entries.to_vec();
        entries.extend(self.embed_entries(fresh).await?);
        IndexSnapshot::assemble(Uuid::new_v4(), entries, refreshed_at)
    }

    /// 지정한 카테고리의 엔트리를 새 청크로 교체
    ///
    /// `base`의 나머지 카테고리는 그대로 유지됩니다. 새 청크 중 `base`에
    /// 같은 ChunkId가 있으면 기존 임베딩을 재사용합니다. `chunks`에 포함된
    /// 카테고리는 `categories`에 없어도 교체 대상으로 취급합니다.
    pub async fn replace_categories(
        &self,
        base: Option<&IndexSnapshot>,
        categories: &BTreeSet<Category>,
        chunks: Vec<Chunk>,
    ) -> Result<IndexSnapshot> {
        let mut replaced: BTreeSet<Category> = categories.clone();
        replaced.extend(chunks.iter().map(|c| c.category));

        let reusable: HashMap<&ChunkId, &Arc<[f32]>> = base
            .map(|s| s.entries.iter().map(|e| (&e.id, &e.embedding)).collect())
            .unwrap_or_default();

        let mut entries: Vec<IndexEntry> = base
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| !replaced.contains(&e.chunk.category))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut pending = Vec::new();
        let mut seen = BTreeSet::new();
        for chunk in chunks {
            let id = ChunkId::compute(&chunk);
            if !seen.insert(id.clone()) {
                continue;
            }
            match reusable.get(&id) {
                Some(embedding) => entries.push(IndexEntry {
                    id,
                    chunk,
                    embedding: Arc::clone(embedding),
                }),
                None => pending.push((id, chunk)),
            }
        }

        tracing::debug!(
            "Building index: {} kept, {} to embed",
            entries.len(),
            pending.len()
        );
        entries.extend(self.embed_entries(pending).await?);

        let now = Utc::now();
        let mut refreshed_at = base.map(|s| s.refreshed_at.clone()).unwrap_or_default();
        for category in &replaced {
            refreshed_at.insert(*category, now);
        }

        IndexSnapshot::assemble(Uuid::new_v4(), entries, refreshed_at)
    }

    /// 배치 단위 임베딩 (배치마다 타임아웃)
    async fn embed_entries(&self, pending: Vec<(ChunkId, Chunk)>) -> Result<Vec<IndexEntry>> {
        let batch_size = self.config.batch_size.max(1);
        let mut entries = Vec::with_capacity(pending.len());
        let mut pending = pending.into_iter();
        let total_batches = (pending.len() + batch_size - 1) / batch_size;

        for batch_no in 0..total_batches {
            let batch: Vec<(ChunkId, Chunk)> = pending.by_ref().take(batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|(_, c)| c.content.clone()).collect();

            let vectors = tokio::time::timeout(self.config.embed_timeout, self.embedder.embed_batch(&texts))
                .await
                .map_err(|_| {
                    KnowledgeError::Embedding(format!(
                        "batch {}/{} timed out after {:?}",
                        batch_no + 1,
                        total_batches,
                        self.config.embed_timeout
                    ))
                })?
                .map_err(|e| KnowledgeError::Embedding(format!("{:#}", e)))?;

            if vectors.len() != batch.len() {
                return Err(KnowledgeError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            tracing::debug!("Embedded batch {}/{}", batch_no + 1, total_batches);
            entries.extend(batch.into_iter().zip(vectors).map(|((id, chunk), vector)| IndexEntry {
                id,
                chunk,
                embedding: Arc::from(vector),
            }));
        }

        Ok(entries)
    }
}

// ============================================================================
// Tests
// ============================================================================
