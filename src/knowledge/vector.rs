//! Vector Index - 메모리 내 dense 검색
//!
//! 스냅샷 엔트리와 같은 순서로 임베딩을 보관하고 코사인 유사도로
//! 전수 검색합니다. 임베딩 버퍼는 `IndexEntry`와 `Arc`로 공유됩니다.

use std::sync::Arc;

use crate::error::{KnowledgeError, Result};

use super::snapshot::ChunkId;

// ============================================================================
// Types
// ============================================================================

/// 검색 결과
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// 스냅샷 엔트리 위치
    pub position: usize,
    /// 유사도 스코어 (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// VectorIndex
// ============================================================================

/// Dense 벡터 인덱스
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimension: usize,
    ids: Vec<ChunkId>,
    vectors: Vec<Arc<[f32]>>,
}

impl VectorIndex {
    /// 엔트리 순서대로 인덱스 구성
    ///
    /// 모든 벡터의 차원이 같아야 합니다.
    pub fn build(rows: impl IntoIterator<Item = (ChunkId, Arc<[f32]>)>) -> Result<Self> {
        let mut index = Self::default();
        for (id, vector) in rows {
            if index.vectors.is_empty() {
                index.dimension = vector.len();
            } else if vector.len() != index.dimension {
                return Err(KnowledgeError::Embedding(format!(
                    "inconsistent embedding dimension: expected {}, got {}",
                    index.dimension,
                    vector.len()
                )));
            }
            index.ids.push(id);
            index.vectors.push(vector);
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn ids(&self) -> &[ChunkId] {
        &self.ids
    }

    /// 코사인 유사도 상위 `limit`개
    ///
    /// `accept(position)`이 false인 엔트리는 후보에서 제외됩니다.
    /// 질의 벡터 차원이 다르거나 유효하지 않은 값이 있으면 에러입니다.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        accept: impl Fn(usize) -> bool,
    ) -> Result<Vec<SearchResult>> {
        if self.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(KnowledgeError::QueryExecution(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(KnowledgeError::QueryExecution(
                "query embedding contains non-finite values".into(),
            ));
        }

        let mut results = Vec::new();
        for (position, vector) in self.vectors.iter().enumerate() {
            if !accept(position) {
                continue;
            }
            let similarity = cosine_similarity(query, vector);
            if !similarity.is_finite() {
                return Err(KnowledgeError::QueryExecution(format!(
                    "corrupt vector at position {}",
                    position
                )));
            }
            results.push(SearchResult {
                position,
                similarity,
            });
        }

        // 동점이면 먼저 인덱싱된 엔트리 우선 (안정 정렬)
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 두 벡터 간의 코사인 유사도를 계산합니다.
/// 결과는 -1.0 ~ 1.0 범위입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
