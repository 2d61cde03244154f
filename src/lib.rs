//! neo-knowledge - 게임 서버 지식 베이스용 하이브리드 인덱스 엔진
//!
//! 주기적으로 수집한 사이트 콘텐츠와 랭킹 데이터를 dense(임베딩) +
//! sparse(BM25) 인덱스로 만들고, 카테고리 필터와 RRF 병합으로 질문에
//! 답합니다. 수집이 실패하면 이전 콘텐츠를 유지합니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod knowledge;
pub mod scraper;
pub mod tool;

// Re-exports
pub use config::{EngineConfig, SourceConfig, SourceRegistry};
pub use embedding::{
    create_embedder, get_api_key, has_api_key, EmbedderKind, EmbeddingProvider, GeminiEmbedding,
    HashingEmbedding,
};
pub use error::{KnowledgeError, Result};
pub use knowledge::{
    Category, CharacterClass, Document, EngineState, EngineStatus, KnowledgeEngine, QueryHit,
    QueryRequest, QueryResult, RankingPartition, RawContent, RefreshReport,
};
pub use scraper::{Acquirer, HttpAcquirer, SitemapEntry};
pub use tool::KnowledgeTool;
