//! Text Chunking Module
//!
//! 긴 문서를 오버랩이 있는 구간으로 분할합니다.
//! 분할 경계 우선순위: 문단 > 문장 > 단어 > 강제 절단.
//!
//! 모든 인덱스는 문자(char) 단위입니다. 각 청크에서 선언된 오버랩 접두사를
//! 제거하고 이어 붙이면 원본 텍스트가 그대로 복원됩니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::category::Category;
use super::normalizer::Document;
use crate::error::{KnowledgeError, Result};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수, 오버랩 포함)
    pub chunk_size: usize,
    /// 오버랩 크기 (문자 수)
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        let config = Self { chunk_size, overlap };
        config.validate()?;
        Ok(config)
    }

    /// `chunk_size > 0`, `overlap < chunk_size`
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(KnowledgeError::Config("chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(KnowledgeError::Config(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// 청크가 유래한 문서 참조
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub origin_url: String,
    /// 같은 카테고리 수집 결과 안에서의 문서 순번
    pub ordinal: usize,
}

/// 검색 단위 텍스트 구간
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    /// 앞 청크와 겹치는 접두사 길이 (문자 수)
    pub overlap_with_predecessor: usize,
    pub source: SourceRef,
    pub chunk_index: usize,
    pub category: Category,
    pub acquired_at: DateTime<Utc>,
}

impl Chunk {
    /// 오버랩을 제외한 새 텍스트
    pub fn fresh_text(&self) -> String {
        self.content.chars().skip(self.overlap_with_predecessor).collect()
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 문서를 청크로 분할
    fn chunk(&self, document: &Document, ordinal: usize) -> Vec<Chunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// BoundaryChunker
// ============================================================================

/// 경계 인식 청커
pub struct BoundaryChunker {
    config: ChunkConfig,
}

impl BoundaryChunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// 텍스트를 (청크, 오버랩 길이) 목록으로 분할
    pub fn split(&self, text: &str) -> Vec<(String, usize)> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        if n == 0 {
            return Vec::new();
        }
        if n <= self.config.chunk_size {
            return vec![(text.to_string(), 0)];
        }

        let mut pieces = Vec::new();
        let mut pos = 0;

        while pos < n {
            let ov = if pos == 0 {
                0
            } else {
                overlap_len(&chars, pos, self.config.overlap)
            };
            let start = pos - ov;
            let budget_end = (start + self.config.chunk_size).min(n);
            let end = if budget_end == n {
                n
            } else {
                find_split(&chars, pos, budget_end)
            };

            pieces.push((chars[start..end].iter().collect(), ov));
            pos = end;
        }

        pieces
    }
}

impl Chunker for BoundaryChunker {
    fn chunk(&self, document: &Document, ordinal: usize) -> Vec<Chunk> {
        self.split(&document.content)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, (content, overlap))| Chunk {
                content,
                overlap_with_predecessor: overlap,
                source: SourceRef {
                    origin_url: document.origin_url.clone(),
                    ordinal,
                },
                chunk_index,
                category: document.category,
                acquired_at: document.acquired_at,
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "BoundaryChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 앞 청크에서 가져올 오버랩 길이 (가능하면 단어 시작으로 당김)
fn overlap_len(chars: &[char], pos: usize, overlap: usize) -> usize {
    let ov = overlap.min(pos);
    if ov == 0 {
        return 0;
    }

    let start = pos - ov;
    let snapped = (start..pos).find(|&j| {
        (j == 0 || chars[j - 1].is_whitespace()) && !chars[j].is_whitespace()
    });

    match snapped {
        Some(j) => pos - j,
        None if start > 0 && !chars[start - 1].is_whitespace() => ov,
        None => 0,
    }
}

/// `(pos, budget_end]` 안에서 가장 늦은 분할 지점
fn find_split(chars: &[char], pos: usize, budget_end: usize) -> usize {
    let candidates = (pos + 1..=budget_end).rev();

    // 문단
    if let Some(i) = candidates
        .clone()
        .find(|&i| i >= pos + 2 && chars[i - 1] == '\n' && chars[i - 2] == '\n')
    {
        return i;
    }

    // 문장
    if let Some(i) = candidates.clone().find(|&i| {
        chars[i - 1] == '\n'
            || (i >= pos + 2 && chars[i - 1] == ' ' && matches!(chars[i - 2], '.' | '!' | '?'))
    }) {
        return i;
    }

    // 단어
    if let Some(i) = candidates.clone().find(|&i| chars[i - 1].is_whitespace()) {
        return i;
    }

    budget_end
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(BoundaryChunker {
        config: ChunkConfig::default(),
    })
}

/// 설정 지정 청커 생성
pub fn boundary_chunker(config: ChunkConfig) -> Result<Box<dyn Chunker>> {
    Ok(Box::new(BoundaryChunker::new(config)?))
}

// ============================================================================
// Tests
// ============================================================================
