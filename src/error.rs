//! 에러 타입 - 지식 엔진 장애 분류
//!
//! 카테고리 단위 장애(수집/임베딩)는 엔진 내부에서 복구되고,
//! 조회 장애와 "결과 없음"은 서로 다른 결과로 호출자에게 전달됩니다.
//! 사용자용 문구로의 변환은 `tool` 모듈에서만 수행합니다.

use std::path::PathBuf;

use thiserror::Error;

use crate::knowledge::Category;

/// 지식 엔진 결과 타입
pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// 지식 엔진 에러
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// 카테고리 수집 실패 (이전 콘텐츠 유지 정책 적용)
    #[error("acquisition failed for {category}: {reason}")]
    Acquisition { category: Category, reason: String },

    /// 카테고리 수집 타임아웃
    #[error("acquisition timed out for {category}")]
    AcquisitionTimeout { category: Category },

    /// 임베딩 프로바이더 실패 (진행 중인 빌드만 중단)
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// 디스크 스냅샷 손상
    #[error("index snapshot at {path:?} is unreadable: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// 인덱스는 있으나 검색 자체가 실패
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// 첫 인덱스 빌드 전
    #[error("knowledge index is still initializing")]
    NotReady,

    /// 영속화 실패 (LanceDB, SQLite, 파일)
    #[error("storage error: {0}")]
    Storage(String),

    /// 설정 오류
    #[error("configuration error: {0}")]
    Config(String),

    /// 종료 요청으로 리프레시 중단
    #[error("refresh cancelled")]
    Cancelled,

    /// 사용 가능한 인덱스를 만들 수 없음 (치명적)
    #[error("no usable index could be produced: {0}")]
    NoUsableIndex(String),
}

impl KnowledgeError {
    /// 카테고리 범위 장애 여부 (리프레시 전체를 중단하지 않음)
    pub fn is_category_scoped(&self) -> bool {
        matches!(
            self,
            KnowledgeError::Acquisition { .. } | KnowledgeError::AcquisitionTimeout { .. }
        )
    }

    /// anyhow 에러를 저장소 에러로 변환
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        KnowledgeError::Storage(format!("{:#}", err))
    }
}
