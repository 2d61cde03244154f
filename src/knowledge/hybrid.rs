//! 하이브리드 검색 - dense + BM25 RRF 통합
//!
//! 1. Dense: 질문 임베딩 → 코사인 유사도 상위 2k
//! 2. Lexical: BM25 상위 2k (점수 > 0)
//! 3. 카테고리 필터는 두 후보 검색 안에서 적용 (병합 전)
//! 4. RRF 병합, ChunkId 기준 중복 제거
//! 5. 필터가 전부 최신성 카테고리면 시간 역순 안정 정렬
//! 6. k개로 자름
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::{KnowledgeError, Result};

use super::category::Category;
use super::snapshot::{ChunkId, IndexSnapshot};
use super::vector::SearchResult;

/// RRF 상수
const RRF_K: f32 = 60.0;

// ============================================================================
// Types
// ============================================================================

/// 검색 요청
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub k: usize,
    /// None이면 전체 카테고리
    pub category_filter: Option<BTreeSet<Category>>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, k: usize) -> Self {
        Self {
            question: question.into(),
            k,
            category_filter: None,
        }
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.category_filter = Some(categories.into_iter().collect());
        self
    }

    /// 필터의 모든 카테고리가 최신성 카테고리인지
    fn recency_applies(&self) -> bool {
        match &self.category_filter {
            Some(filter) if !filter.is_empty() => filter.iter().all(Category::is_time_sensitive),
            _ => false,
        }
    }
}

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// 벡터 검색에서만 발견
    Vector,
    /// BM25 검색에서만 발견
    Lexical,
    /// 양쪽 모두에서 발견
    Hybrid,
}

/// 검색 결과 항목
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub id: ChunkId,
    pub content: String,
    pub category: Category,
    pub origin_url: String,
    pub acquired_at: DateTime<Utc>,
    /// RRF 통합 스코어 (높을수록 좋음)
    pub score: f32,
    pub method: SearchMethod,
}

/// 검색 결과 (길이 ≤ k)
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub hits: Vec<QueryHit>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }
}

// ============================================================================
// QueryEngine
// ============================================================================

/// 하이브리드 검색기
///
/// 스냅샷은 호출자가 넘겨주며, 검색 중 교체되어도 영향받지 않습니다.
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    embed_timeout: Duration,
}

impl QueryEngine {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, embed_timeout: Duration) -> Self {
        Self {
            embedder,
            embed_timeout,
        }
    }

    /// 하이브리드 검색 (RRF 통합)
    pub async fn query(&self, snapshot: &IndexSnapshot, request: &QueryRequest) -> Result<QueryResult> {
        if request.k == 0 || snapshot.is_empty() {
            return Ok(QueryResult::default());
        }

        let entries = snapshot.entries();
        let accept = |pos: usize| {
            request
                .category_filter
                .as_ref()
                .map_or(true, |filter| filter.contains(&entries[pos].chunk.category))
        };
        if !(0..entries.len()).any(accept) {
            return Ok(QueryResult::default());
        }

        let candidates = request.k.saturating_mul(2);

        // 1. BM25 키워드 검색
        let lexical = snapshot.lexical().search(&request.question, candidates, accept);

        // 2. 벡터 검색
        let query_embedding = tokio::time::timeout(self.embed_timeout, self.embedder.embed(&request.question))
            .await
            .map_err(|_| {
                KnowledgeError::QueryExecution(format!(
                    "question embedding timed out after {:?}",
                    self.embed_timeout
                ))
            })?
            .map_err(|e| KnowledgeError::QueryExecution(format!("question embedding failed: {:#}", e)))?;
        let dense = snapshot.vector().search(&query_embedding, candidates, accept)?;

        tracing::debug!(
            "Query candidates: {} lexical, {} dense",
            lexical.len(),
            dense.len()
        );

        // 3. RRF 통합
        let merged = rrf_merge(&lexical, &dense);

        let mut hits: Vec<QueryHit> = merged
            .into_iter()
            .map(|fused| {
                let entry = &entries[fused.position];
                QueryHit {
                    id: entry.id.clone(),
                    content: entry.chunk.content.clone(),
                    category: entry.chunk.category,
                    origin_url: entry.chunk.source.origin_url.clone(),
                    acquired_at: entry.chunk.acquired_at,
                    score: fused.score,
                    method: fused.method(),
                }
            })
            .collect();

        // 4. 최신성 정렬 (안정 정렬이라 동일 시각은 RRF 순서 유지)
        if request.recency_applies() {
            hits.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        }

        hits.truncate(request.k);
        Ok(QueryResult { hits })
    }
}

// ============================================================================
// RRF
// ============================================================================

/// RRF 병합 결과
#[derive(Debug, Clone, PartialEq)]
struct Fused {
    position: usize,
    score: f32,
    lexical_rank: Option<usize>,
    dense_rank: Option<usize>,
}

impl Fused {
    fn method(&self) -> SearchMethod {
        match (self.lexical_rank.is_some(), self.dense_rank.is_some()) {
            (true, true) => SearchMethod::Hybrid,
            (true, false) => SearchMethod::Lexical,
            _ => SearchMethod::Vector,
        }
    }
}

/// RRF (Reciprocal Rank Fusion) 알고리즘
///
/// RRF Score = sum(1 / (k + rank + 1)), k = 60
///
/// 엔트리 위치가 같으면 같은 ChunkId이므로 위치로 중복을 제거합니다.
/// 동점은 BM25 순위, 그다음 dense 순위로 결정합니다.
fn rrf_merge(lexical: &[(usize, f32)], dense: &[SearchResult]) -> Vec<Fused> {
    let mut fused: HashMap<usize, Fused> = HashMap::new();

    for (rank, (position, _)) in lexical.iter().enumerate() {
        let entry = fused.entry(*position).or_insert(Fused {
            position: *position,
            score: 0.0,
            lexical_rank: None,
            dense_rank: None,
        });
        entry.score += 1.0 / (RRF_K + rank as f32 + 1.0);
        entry.lexical_rank = Some(rank);
    }

    for (rank, result) in dense.iter().enumerate() {
        let entry = fused.entry(result.position).or_insert(Fused {
            position: result.position,
            score: 0.0,
            lexical_rank: None,
            dense_rank: None,
        });
        entry.score += 1.0 / (RRF_K + rank as f32 + 1.0);
        entry.dense_rank = Some(rank);
    }

    let mut results: Vec<Fused> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank_order(a.lexical_rank, b.lexical_rank))
            .then_with(|| rank_order(a.dense_rank, b.dense_rank))
            .then_with(|| a.position.cmp(&b.position))
    });
    results
}

/// 순위 비교 (없는 순위는 가장 뒤)
fn rank_order(a: Option<usize>, b: Option<usize>) -> Ordering {
    a.unwrap_or(usize::MAX).cmp(&b.unwrap_or(usize::MAX))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedding;
    use crate::knowledge::chunker::{Chunk, SourceRef};
    use crate::knowledge::snapshot::{BuildConfig, IndexBuilder};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn chunk(category: Category, origin: &str, content: &str, day: u32) -> Chunk {
        Chunk {
            content: content.to_string(),
            overlap_with_predecessor: 0,
            source: SourceRef {
                origin_url: origin.to_string(),
                ordinal: 0,
            },
            chunk_index: 0,
            category,
            acquired_at: Utc.with_ymd_and_hms(2025, 5, day, 0, 0, 0).unwrap(),
        }
    }

    async fn snapshot(chunks: Vec<Chunk>) -> IndexSnapshot {
        IndexBuilder::new(Arc::new(HashingEmbedding::new(64).unwrap()), BuildConfig::default())
            .build(chunks)
            .await
            .unwrap()
    }

    fn engine() -> QueryEngine {
        QueryEngine::new(Arc::new(HashingEmbedding::new(64).unwrap()), Duration::from_secs(5))
    }

    struct BrokenEmbedding;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedding {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("provider down")
        }

        fn dimension(&self) -> usize {
            64
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn test_rrf_score_calculation() {
        // 1위: 1 / (60 + 0 + 1) = 1/61 ≈ 0.0164
        let score_rank_1 = 1.0 / (RRF_K + 0.0 + 1.0);
        assert!((score_rank_1 - 0.0164).abs() < 0.001);

        // 5위: 1 / (60 + 4 + 1) = 1/65 ≈ 0.0154
        let score_rank_5 = 1.0 / (RRF_K + 4.0 + 1.0);
        assert!((score_rank_5 - 0.0154).abs() < 0.001);
    }

    #[test]
    fn test_rrf_merge_dedup_and_tie_break() {
        // 위치 7은 양쪽 모두, 3은 BM25 1위, 9는 dense 1위
        let lexical = vec![(3, 5.0), (7, 2.0)];
        let dense = vec![
            SearchResult { position: 9, similarity: 0.9 },
            SearchResult { position: 7, similarity: 0.8 },
        ];
        let merged = rrf_merge(&lexical, &dense);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].position, 7);
        assert_eq!(merged[0].method(), SearchMethod::Hybrid);
        // 3과 9는 동점 → BM25 순위가 있는 3이 먼저
        assert_eq!(merged[1].position, 3);
        assert_eq!(merged[2].position, 9);
        assert_eq!(merged[2].method(), SearchMethod::Vector);
    }

    #[tokio::test]
    async fn test_category_filter_applied_before_merge() {
        let snapshot = snapshot(vec![
            chunk(Category::Shop, "s", "shop potion prices", 1),
            chunk(Category::Faq, "f", "how to buy a potion", 2),
            chunk(Category::Vip, "v", "vip potion discount", 3),
        ])
        .await;

        let request = QueryRequest::new("potion", 3).with_categories([Category::Faq]);
        let result = engine().query(&snapshot, &request).await.unwrap();

        assert_eq!(result.len(), 1);
        assert!(result.hits.iter().all(|h| h.category == Category::Faq));
    }

    #[tokio::test]
    async fn test_recency_sort_for_news_only() {
        let snapshot = snapshot(vec![
            chunk(Category::News, "n1", "event patch event event", 1),
            chunk(Category::News, "n2", "event", 20),
            chunk(Category::News, "n3", "patch event notes", 10),
        ])
        .await;

        let request = QueryRequest::new("event", 3).with_categories([Category::News]);
        let result = engine().query(&snapshot, &request).await.unwrap();

        let days: Vec<DateTime<Utc>> = result.hits.iter().map(|h| h.acquired_at).collect();
        let mut sorted = days.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(days, sorted);
        assert_eq!(result.hits[0].origin_url, "n2");
    }

    #[tokio::test]
    async fn test_truncates_to_k_and_empty_cases() {
        let snapshot = snapshot(
            (0..10)
                .map(|i| chunk(Category::Faq, &format!("f{}", i), &format!("question {}", i), 1))
                .collect(),
        )
        .await;

        let result = engine()
            .query(&snapshot, &QueryRequest::new("question", 3))
            .await
            .unwrap();
        assert_eq!(result.len(), 3);

        let none = engine()
            .query(&snapshot, &QueryRequest::new("question", 3).with_categories([Category::Shop]))
            .await
            .unwrap();
        assert!(none.is_empty());

        let empty = engine()
            .query(&IndexSnapshot::empty(), &QueryRequest::new("question", 3))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_huge_k_returns_all_matches() {
        let snapshot = snapshot(vec![
            chunk(Category::Faq, "f1", "question one", 1),
            chunk(Category::Faq, "f2", "question two", 1),
        ])
        .await;

        let result = engine()
            .query(&snapshot, &QueryRequest::new("question", usize::MAX))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_query_error() {
        let snapshot = snapshot(vec![chunk(Category::Faq, "f", "login help", 1)]).await;
        let engine = QueryEngine::new(Arc::new(BrokenEmbedding), Duration::from_secs(5));

        let err = engine
            .query(&snapshot, &QueryRequest::new("login", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::QueryExecution(_)));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_query_error() {
        let snapshot = snapshot(vec![chunk(Category::Faq, "f", "login help", 1)]).await;
        let engine = QueryEngine::new(Arc::new(HashingEmbedding::new(8).unwrap()), Duration::from_secs(5));

        let err = engine
            .query(&snapshot, &QueryRequest::new("login", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::QueryExecution(_)));
    }
}
