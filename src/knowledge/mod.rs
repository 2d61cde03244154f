//! Knowledge 모듈 - 하이브리드 지식 인덱스 엔진
//!
//! - Normalizer: HTML/텍스트/랭킹 표 → Document
//! - Chunker: 경계 인식 오버랩 분할
//! - Snapshot: 벡터 + BM25 인덱스 쌍 (불변, 세대 교체)
//! - LanceDB: 카테고리별 스냅샷 영속화
//! - SQLite: 문서 보관소 + 수동 위치
//! - Hybrid: RRF 알고리즘으로 두 검색 결과 통합
//! - Lifecycle: 시작, 주기적 리프레시, 폴백, 종료

mod category;
mod chunker;
mod defaults;
mod hybrid;
mod lance;
mod lexical;
mod lifecycle;
mod normalizer;
mod rankings;
mod snapshot;
mod store;
mod vector;

// Re-exports
pub use category::{Category, RankingPartition};
pub use chunker::{
    boundary_chunker, default_chunker, BoundaryChunker, Chunk, ChunkConfig, Chunker, SourceRef,
};
pub use defaults::{default_documents, DEFAULT_ORIGIN_PREFIX};
pub use hybrid::{QueryEngine, QueryHit, QueryRequest, QueryResult, SearchMethod};
pub use lance::{Manifest, SnapshotStore};
pub use lexical::{tokenize, LexicalIndex};
pub use lifecycle::{
    CategoryFailure, CategoryStatus, EngineState, EngineStatus, KnowledgeEngine, RefreshReport,
};
pub use normalizer::{
    extract_content_timestamp, normalize, normalize_whitespace, resolve_timestamp, ContentFormat,
    Document, RawContent, TimestampSource,
};
pub use rankings::{
    group_thousands, parse_guild_ranking, parse_memorial_ranking, parse_power_ranking,
    parse_value, CharacterClass, GuildEntry, MemorialEntry, Nation, PowerEntry, RankingRow,
};
pub use snapshot::{BuildConfig, ChunkId, IndexBuilder, IndexEntry, IndexSnapshot};
pub use store::{get_data_dir, ArchiveStats, DocumentArchive, ManualLocation};
pub use vector::{cosine_similarity, SearchResult, VectorIndex};
