//! 백업 문서 수집 모듈
//!
//! `<data_dir>/backup/<category key>/` 아래의 텍스트/마크다운/HTML 파일을
//! 원본 콘텐츠로 읽습니다. 수집이 실패하고 보관소에도 문서가 없을 때
//! 기본 코퍼스 직전의 폴백으로 사용됩니다.
//! .gitignore 패턴을 존중하고, 지원하는 확장자만 수집합니다.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;

use crate::knowledge::{Category, RawContent};

/// 백업 문서 원본 표기
pub const BACKUP_ORIGIN_PREFIX: &str = "backup:";

// ============================================================================
// File Types
// ============================================================================

/// 지원하는 파일 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// 텍스트 파일 (txt, md)
    Text,
    /// 저장된 HTML 페이지
    Html,
}

impl FileType {
    /// 확장자로 파일 타입 결정
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "md" | "markdown" => Some(FileType::Text),
            "html" | "htm" => Some(FileType::Html),
            _ => None,
        }
    }

    /// 파일 경로에서 타입 결정
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

// ============================================================================
// Collected File
// ============================================================================

/// 수집된 파일 정보
#[derive(Debug, Clone)]
pub struct CollectedFile {
    pub path: PathBuf,
    pub file_type: FileType,
    /// 파일 크기 (바이트)
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

impl CollectedFile {
    /// 파일에서 CollectedFile 생성 (지원하지 않는 확장자면 None)
    pub fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let Some(file_type) = FileType::from_path(&path) else {
            return Ok(None);
        };

        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata: {:?}", path))?;

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            file_type,
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
        }))
    }
}

// ============================================================================
// Backup Loader
// ============================================================================

/// 백업 수집 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore 패턴 존중 여부
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// 카테고리별 백업 문서 로더
pub struct BackupLoader {
    root: PathBuf,
    config: CollectorConfig,
}

impl BackupLoader {
    pub fn new(root: impl Into<PathBuf>, config: CollectorConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// 기본 설정으로 로더 생성
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, CollectorConfig::default())
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.key())
    }

    /// 카테고리 디렉토리의 파일 목록 (경로 순)
    ///
    /// 디렉토리가 없으면 빈 목록입니다.
    pub fn collect(&self, category: Category) -> Result<Vec<CollectedFile>> {
        let dir = self.category_dir(category);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();

        // ignore 크레이트로 .gitignore 지원
        let walker = WalkBuilder::new(&dir)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(false)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read backup entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            match CollectedFile::from_path(entry.path().to_path_buf()) {
                Ok(Some(file)) => {
                    if self.should_include(&file) {
                        files.push(file);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to collect backup file: {}", e),
            }
        }

        tracing::debug!("Collected {} backup files for {}", files.len(), category);
        Ok(files)
    }

    /// 카테고리 백업 파일을 원본 콘텐츠로 읽기
    ///
    /// 수집 시각은 파일 수정 시각입니다.
    pub fn load(&self, category: Category) -> Result<Vec<RawContent>> {
        let dir = self.category_dir(category);
        let mut contents = Vec::new();

        for file in self.collect(category)? {
            let body = std::fs::read_to_string(&file.path)
                .with_context(|| format!("Failed to read backup file: {:?}", file.path))?;
            let relative = file.path.strip_prefix(&dir).unwrap_or(&file.path);
            let origin = format!(
                "{}{}/{}",
                BACKUP_ORIGIN_PREFIX,
                category.key(),
                relative.to_string_lossy().replace('\\', "/")
            );
            let acquired_at: DateTime<Utc> = file
                .modified_at
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);

            let raw = match file.file_type {
                FileType::Text => RawContent::text(body, origin),
                FileType::Html => RawContent::html(body, origin),
            };
            contents.push(raw.acquired(acquired_at));
        }

        if !contents.is_empty() {
            tracing::info!("Loaded {} backup documents for {}", contents.len(), category);
        }
        Ok(contents)
    }

    /// 파일이 필터 조건을 만족하는지 확인
    fn should_include(&self, file: &CollectedFile) -> bool {
        if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
            tracing::debug!("Skipping large file: {:?} ({} bytes)", file.path, file.size);
            return false;
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
