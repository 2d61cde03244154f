//! 엔진 설정 - TOML 파일 + 환경변수 오버레이
//!
//! 로딩 순서:
//! 1. 기본값
//! 2. `--config` 경로 또는 `<data_dir>/config.toml` (있으면)
//! 3. 환경변수 (`NEO_KNOWLEDGE_DATA_DIR`, `NEO_KNOWLEDGE_EMBEDDER`)
//!
//! API 키(`GEMINI_API_KEY`/`GOOGLE_AI_API_KEY`)는 설정 파일에 두지 않고
//! 임베딩 모듈이 직접 읽습니다.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::embedding::{EmbedderKind, DEFAULT_DIMENSION};
use crate::error::{KnowledgeError, Result};
use crate::knowledge::{
    get_data_dir, BuildConfig, Category, ChunkConfig, ManualLocation, RankingPartition,
};

pub const CONFIG_FILE: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "NEO_KNOWLEDGE_DATA_DIR";
pub const ENV_EMBEDDER: &str = "NEO_KNOWLEDGE_EMBEDDER";

const DEFAULT_BASE_URL: &str = "https://www.neogames.online";

// ============================================================================
// EngineConfig
// ============================================================================

/// 엔진 전체 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 데이터 디렉토리 (인덱스, 보관소, 백업)
    pub data_dir: PathBuf,
    pub base_url: String,
    /// 비어 있으면 사이트맵 탐색 생략
    pub sitemap_url: Option<String>,
    pub chunking: ChunkConfig,
    pub build: BuildSection,
    pub acquisition: AcquisitionSection,
    pub embedding: EmbeddingSection,
    /// 기본 리프레시 주기 (초)
    pub refresh_interval_secs: u64,
    /// 기본 검색 결과 수
    pub default_k: usize,
    /// 카테고리 키별 재정의
    pub categories: BTreeMap<String, CategoryOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub batch_size: usize,
    pub embed_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSection {
    /// 카테고리 하나의 수집 제한 시간 (모든 위치 합계)
    pub timeout_secs: u64,
    /// 위치 하나(HTTP 요청 1회)의 제한 시간, `timeout_secs` 이하
    pub request_timeout_secs: u64,
    /// 리프레시 실패 후 재시도까지 대기
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub kind: EmbedderKind,
    pub dimension: usize,
}

/// 카테고리별 재정의
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryOverride {
    pub refresh_interval_secs: Option<u64>,
    pub priority: Option<u32>,
    /// 기본 시드에 추가할 위치
    pub seeds: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            base_url: DEFAULT_BASE_URL.to_string(),
            sitemap_url: Some(format!("{}/sitemap.xml", DEFAULT_BASE_URL)),
            chunking: ChunkConfig::default(),
            build: BuildSection::default(),
            acquisition: AcquisitionSection::default(),
            embedding: EmbeddingSection::default(),
            refresh_interval_secs: 6 * 60 * 60,
            default_k: 3,
            categories: BTreeMap::new(),
        }
    }
}

impl Default for BuildSection {
    fn default() -> Self {
        let build = BuildConfig::default();
        Self {
            batch_size: build.batch_size,
            embed_timeout_secs: build.embed_timeout.as_secs(),
        }
    }
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            request_timeout_secs: 30,
            retry_delay_secs: 60,
        }
    }
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::default(),
            dimension: DEFAULT_DIMENSION,
        }
    }
}

impl EngineConfig {
    /// 설정 로드
    ///
    /// `explicit`가 주어졌는데 파일이 없으면 에러입니다.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(KnowledgeError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Self::from_file(path)?
            }
            None => {
                let data_dir = std::env::var(ENV_DATA_DIR)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(get_data_dir);
                let path = data_dir.join(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self {
                        data_dir,
                        ..Self::default()
                    }
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일 파싱 (검증 전)
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KnowledgeError::Config(format!("read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
            .map_err(|e| KnowledgeError::Config(format!("parse config {}: {}", path.display(), e)))
    }

    pub fn from_toml(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// 환경변수 오버레이
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(kind) = lookup(ENV_EMBEDDER).filter(|v| !v.is_empty()) {
            self.embedding.kind = kind
                .parse()
                .map_err(|e: anyhow::Error| KnowledgeError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        Url::parse(&self.base_url)
            .map_err(|e| KnowledgeError::Config(format!("invalid base_url {}: {}", self.base_url, e)))?;
        if let Some(sitemap) = &self.sitemap_url {
            Url::parse(sitemap)
                .map_err(|e| KnowledgeError::Config(format!("invalid sitemap_url {}: {}", sitemap, e)))?;
        }
        if self.build.batch_size == 0 {
            return Err(KnowledgeError::Config("build.batch_size must be positive".into()));
        }
        if self.build.embed_timeout_secs == 0
            || self.acquisition.timeout_secs == 0
            || self.acquisition.request_timeout_secs == 0
        {
            return Err(KnowledgeError::Config("timeouts must be positive".into()));
        }
        if self.acquisition.request_timeout_secs > self.acquisition.timeout_secs {
            return Err(KnowledgeError::Config(format!(
                "acquisition.request_timeout_secs ({}) must not exceed acquisition.timeout_secs ({})",
                self.acquisition.request_timeout_secs, self.acquisition.timeout_secs
            )));
        }
        if self.refresh_interval_secs == 0 {
            return Err(KnowledgeError::Config("refresh_interval_secs must be positive".into()));
        }
        if self.default_k == 0 {
            return Err(KnowledgeError::Config("default_k must be positive".into()));
        }
        for (key, over) in &self.categories {
            key.parse::<Category>()?;
            if over.refresh_interval_secs == Some(0) {
                return Err(KnowledgeError::Config(format!(
                    "refresh_interval_secs for {} must be positive",
                    key
                )));
            }
        }
        Ok(())
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join("archive.db")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backup")
    }

    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            batch_size: self.build.batch_size,
            embed_timeout: Duration::from_secs(self.build.embed_timeout_secs),
        }
    }

    /// 카테고리 전체 수집 제한 시간
    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition.timeout_secs)
    }

    /// HTTP 요청 1회 제한 시간
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.acquisition.retry_delay_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.build.embed_timeout_secs)
    }

    /// 카테고리 재정의 조회 (키 별칭 허용)
    fn override_for(&self, category: Category) -> Option<&CategoryOverride> {
        self.categories
            .iter()
            .find(|(key, _)| key.parse::<Category>().ok() == Some(category))
            .map(|(_, over)| over)
    }
}

// ============================================================================
// SourceConfig
// ============================================================================

/// 카테고리별 수집 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceConfig {
    pub category: Category,
    /// 절대 URL 목록 (순서 유지, 중복 없음)
    pub seeds: Vec<String>,
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// 낮을수록 먼저 수집
    pub priority: u32,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// 카테고리 기본 시드 경로
fn default_seed_path(category: Category) -> String {
    match category {
        Category::Main => "/".to_string(),
        Category::Ranking(RankingPartition::Power(None)) => "/ranking/power".to_string(),
        Category::Ranking(RankingPartition::Power(Some(class))) => {
            format!("/ranking/power?classId={}", class.id())
        }
        Category::Ranking(RankingPartition::Guild) => "/ranking/guild".to_string(),
        Category::Ranking(RankingPartition::Memorial) => "/ranking/memorial".to_string(),
        other => format!("/{}", other.key()),
    }
}

/// 카테고리 기본 우선순위
fn default_priority(category: Category) -> u32 {
    match category {
        Category::Main => 0,
        Category::News => 1,
        Category::Ranking(_) => 5,
        _ => 3,
    }
}

/// 상대 경로를 기준 URL로 해석
///
/// 절대 http(s) URL은 정규화만 합니다.
pub fn resolve_location(base_url: &str, location: &str) -> Result<String> {
    let location = location.trim();
    if location.is_empty() {
        return Err(KnowledgeError::Config("empty location".into()));
    }

    let resolved = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(base_url)
                .map_err(|e| KnowledgeError::Config(format!("invalid base_url {}: {}", base_url, e)))?;
            base.join(location)
                .map_err(|e| KnowledgeError::Config(format!("invalid location {}: {}", location, e)))?
        }
        Err(e) => {
            return Err(KnowledgeError::Config(format!(
                "invalid location {}: {}",
                location, e
            )))
        }
    };

    match resolved.scheme() {
        "http" | "https" => Ok(resolved.to_string()),
        other => Err(KnowledgeError::Config(format!(
            "unsupported scheme {} in {}",
            other, location
        ))),
    }
}

// ============================================================================
// SourceRegistry
// ============================================================================

/// 카테고리 → 수집 설정
///
/// 시작 시 정적 설정과 보관소의 수동 위치로 한 번 만들어집니다.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    base_url: String,
    sources: BTreeMap<Category, SourceConfig>,
}

impl SourceRegistry {
    pub fn from_config(config: &EngineConfig, manual: &[ManualLocation]) -> Result<Self> {
        let default_interval = Duration::from_secs(config.refresh_interval_secs);
        let mut sources = BTreeMap::new();

        for category in Category::all() {
            let over = config.override_for(category);
            let mut seeds = Vec::new();
            let mut seen = HashSet::new();

            let candidates = std::iter::once(default_seed_path(category))
                .chain(over.map(|o| o.seeds.clone()).unwrap_or_default())
                .chain(
                    manual
                        .iter()
                        .filter(|m| m.category == category)
                        .map(|m| m.url.clone()),
                );
            for location in candidates {
                let url = resolve_location(&config.base_url, &location)?;
                if seen.insert(url.clone()) {
                    seeds.push(url);
                }
            }

            sources.insert(
                category,
                SourceConfig {
                    category,
                    seeds,
                    refresh_interval: over
                        .and_then(|o| o.refresh_interval_secs)
                        .map(Duration::from_secs)
                        .unwrap_or(default_interval),
                    priority: over
                        .and_then(|o| o.priority)
                        .unwrap_or_else(|| default_priority(category)),
                },
            );
        }

        Ok(Self {
            base_url: config.base_url.clone(),
            sources,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get(&self, category: Category) -> Option<&SourceConfig> {
        self.sources.get(&category)
    }

    /// 우선순위 순 (동순위는 카테고리 순)
    pub fn by_priority(&self) -> Vec<&SourceConfig> {
        let mut out: Vec<&SourceConfig> = self.sources.values().collect();
        out.sort_by_key(|s| (s.priority, s.category));
        out
    }

    /// 런타임 위치 추가 (이미 있으면 false)
    pub fn add_location(&mut self, category: Category, url: &str) -> bool {
        let Some(source) = self.sources.get_mut(&category) else {
            return false;
        };
        if source.seeds.iter().any(|s| s == url) {
            return false;
        }
        source.seeds.push(url.to_string());
        true
    }

    /// 런타임 위치 제거 (없으면 false)
    pub fn remove_location(&mut self, category: Category, url: &str) -> bool {
        let Some(source) = self.sources.get_mut(&category) else {
            return false;
        };
        let before = source.seeds.len();
        source.seeds.retain(|s| s != url);
        source.seeds.len() != before
    }
}
