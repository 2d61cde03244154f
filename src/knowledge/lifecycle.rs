//! Refresh Lifecycle Manager - 초기 로드/빌드, 주기적 재수집, 폴백, 종료
//!
//! 상태: `Uninitialized → Loading → Ready ⇄ Refreshing → ShuttingDown → Stopped`
//!
//! - 쓰기는 하나 (tokio Mutex로 리프레시 직렬화)
//! - 읽기는 여럿 (RwLock은 Arc 복제 동안만 보유)
//! - 실패한 카테고리는 이전 콘텐츠 유지: 현재 스냅샷 → 보관소 → 백업 파일
//! - 시도한 카테고리가 모두 실패하면 콘텐츠 없는 카테고리에 기본 코퍼스

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collector::BackupLoader;
use crate::config::{resolve_location, EngineConfig, SourceConfig, SourceRegistry};
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::{KnowledgeError, Result};
use crate::scraper::{group_by_category, Acquirer, HttpAcquirer};

use super::category::Category;
use super::chunker::{boundary_chunker, Chunk, Chunker};
use super::defaults::default_documents;
use super::hybrid::{QueryEngine, QueryRequest, QueryResult};
use super::lance::SnapshotStore;
use super::normalizer::{normalize, Document};
use super::snapshot::{IndexBuilder, IndexSnapshot};
use super::store::DocumentArchive;

/// 리프레시 루프가 잠드는 최소 시간
const MIN_SLEEP: Duration = Duration::from_secs(1);

// ============================================================================
// State & Reports
// ============================================================================

/// 엔진 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Refreshing,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Refreshing => "refreshing",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 카테고리 상태
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub category: Category,
    pub entries: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// 마지막 시도가 실패한 시각
    pub failed_at: Option<DateTime<Utc>>,
}

/// 엔진 상태 보고
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub generation: Option<Uuid>,
    pub entry_count: usize,
    pub categories: Vec<CategoryStatus>,
}

/// 카테고리 실패 기록
#[derive(Debug, Clone, Serialize)]
pub struct CategoryFailure {
    pub category: Category,
    pub reason: String,
}

/// 리프레시 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// 교체 후 세대 (변경 없으면 기존 세대)
    pub generation: Option<Uuid>,
    pub entry_count: usize,
    pub succeeded: Vec<Category>,
    pub failed: Vec<CategoryFailure>,
    /// 실패했지만 이전 콘텐츠를 유지한 카테고리
    pub retained: Vec<Category>,
    /// 기본 코퍼스를 받은 카테고리
    pub defaulted: Vec<Category>,
}

// ============================================================================
// KnowledgeEngine
// ============================================================================

/// 지식 엔진 핸들 (복제 가능)
#[derive(Clone)]
pub struct KnowledgeEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    state: Mutex<EngineState>,
    /// 단일 writer
    writer: tokio::sync::Mutex<()>,
    registry: RwLock<SourceRegistry>,
    failures: Mutex<HashMap<Category, DateTime<Utc>>>,
    store: SnapshotStore,
    archive: DocumentArchive,
    backup: BackupLoader,
    builder: IndexBuilder,
    engine: QueryEngine,
    chunker: Box<dyn Chunker>,
    acquirer: Arc<dyn Acquirer>,
    shutdown: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KnowledgeEngine {
    /// 엔진 생성 (아직 시작하지 않음)
    pub fn new(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        acquirer: Arc<dyn Acquirer>,
    ) -> Result<Self> {
        config.validate()?;

        let archive = DocumentArchive::open(&config.archive_path()).map_err(KnowledgeError::storage)?;
        let manual = archive.locations().map_err(KnowledgeError::storage)?;
        let registry = SourceRegistry::from_config(&config, &manual)?;
        let chunker = boundary_chunker(config.chunking)?;

        let inner = Inner {
            snapshot: RwLock::new(None),
            state: Mutex::new(EngineState::Uninitialized),
            writer: tokio::sync::Mutex::new(()),
            registry: RwLock::new(registry),
            failures: Mutex::new(HashMap::new()),
            store: SnapshotStore::new(config.index_dir()),
            archive,
            backup: BackupLoader::with_defaults(config.backup_dir()),
            builder: IndexBuilder::new(Arc::clone(&embedder), config.build_config()),
            engine: QueryEngine::new(embedder, config.embed_timeout()),
            chunker,
            acquirer,
            shutdown: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// 설정의 임베더와 HTTP 수집기로 엔진 생성
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let embedder = create_embedder(config.embedding.kind, config.embedding.dimension)
            .map_err(|e| KnowledgeError::Config(format!("{:#}", e)))?;
        let acquirer = HttpAcquirer::new(config.request_timeout())
            .map_err(|e| KnowledgeError::Config(format!("{:#}", e)))?;
        Self::new(config, embedder, Arc::new(acquirer))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn archive(&self) -> &DocumentArchive {
        &self.inner.archive
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// 현재 스냅샷 (Arc 복제만)
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.inner.current()
    }

    /// 우선순위 순 수집 설정
    pub fn sources(&self) -> Vec<SourceConfig> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_priority()
            .into_iter()
            .cloned()
            .collect()
    }

    /// 엔진 시작
    ///
    /// 저장된 스냅샷이 있으면 (오래됐더라도) 바로 Ready. 없거나 손상됐으면
    /// 동기적으로 첫 빌드를 수행하고, 실패하면 `NoUsableIndex`.
    /// 종료가 시작된 엔진은 다시 시작할 수 없습니다 (`Cancelled`).
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            match *state {
                EngineState::Uninitialized if !self.inner.shutdown.is_cancelled() => {}
                EngineState::Uninitialized | EngineState::ShuttingDown | EngineState::Stopped => {
                    return Err(KnowledgeError::Cancelled);
                }
                _ => {
                    tracing::debug!("Engine already started ({})", *state);
                    return Ok(());
                }
            }
            *state = EngineState::Loading;
        }

        match self.inner.load_persisted().await {
            Some(snapshot) => {
                // shutdown은 writer를 잡은 뒤 스냅샷을 비우므로 같은 잠금 안에서 설치
                let _writer = self.inner.writer.lock().await;
                if self.inner.shutdown.is_cancelled() {
                    return Err(KnowledgeError::Cancelled);
                }
                self.inner.install(snapshot);
                if !self.inner.advance_state(EngineState::Ready) {
                    return Err(KnowledgeError::Cancelled);
                }
            }
            None => {
                tracing::info!("No usable persisted index, building from sources");
                if !self.inner.advance_state(EngineState::Refreshing) {
                    return Err(KnowledgeError::Cancelled);
                }
                let categories = self.inner.ordered_categories(None);
                if let Err(e) = self.inner.refresh(categories, true).await {
                    if self.inner.shutdown.is_cancelled() {
                        return Err(KnowledgeError::Cancelled);
                    }
                    self.inner.advance_state(EngineState::Uninitialized);
                    tracing::error!("Initial index build failed: {}", e);
                    return Err(match e {
                        KnowledgeError::NoUsableIndex(_) => e,
                        other => KnowledgeError::NoUsableIndex(other.to_string()),
                    });
                }
                if !self.inner.advance_state(EngineState::Ready) {
                    return Err(KnowledgeError::Cancelled);
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { run_refresh_loop(inner).await });
        *self.inner.task.lock().await = Some(handle);
        if self.inner.shutdown.is_cancelled() {
            return Err(KnowledgeError::Cancelled);
        }

        tracing::info!("Knowledge engine ready");
        Ok(())
    }

    /// 하이브리드 검색
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let snapshot = self.inner.current().ok_or(KnowledgeError::NotReady)?;
        self.inner.engine.query(&snapshot, request).await
    }

    /// 기본 k로 검색
    pub async fn ask(&self, question: &str, categories: Option<&[Category]>) -> Result<QueryResult> {
        let mut request = QueryRequest::new(question, self.inner.config.default_k);
        if let Some(categories) = categories {
            request = request.with_categories(categories.iter().copied());
        }
        self.query(&request).await
    }

    /// 수동 리프레시 (진행 중인 리프레시가 끝날 때까지 대기)
    pub async fn refresh_now(&self) -> Result<RefreshReport> {
        if self.inner.current().is_none() {
            return Err(KnowledgeError::NotReady);
        }
        let categories = self.inner.ordered_categories(None);
        self.inner.refresh(categories, false).await
    }

    /// 엔진 종료
    ///
    /// 백그라운드 작업을 취소하고 끝날 때까지 기다립니다. 이미 스냅샷을
    /// 잡은 검색은 그대로 완료됩니다.
    pub async fn shutdown(&self) {
        self.inner.set_state(EngineState::ShuttingDown);
        self.inner.shutdown.cancel();

        if let Some(handle) = self.inner.task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Refresh task ended abnormally: {}", e);
            }
        }

        // 진행 중인 수동 리프레시 종료 대기
        let _writer = self.inner.writer.lock().await;
        *self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.set_state(EngineState::Stopped);
        tracing::info!("Knowledge engine stopped");
    }

    /// 상태 보고
    pub fn status(&self) -> EngineStatus {
        let snapshot = self.inner.current();
        let failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let counts = snapshot
            .as_ref()
            .map(|s| s.category_counts())
            .unwrap_or_default();

        let categories = Category::all()
            .into_iter()
            .map(|category| CategoryStatus {
                category,
                entries: counts.get(&category).copied().unwrap_or(0),
                refreshed_at: snapshot
                    .as_ref()
                    .and_then(|s| s.refreshed_at().get(&category).copied()),
                failed_at: failures.get(&category).copied(),
            })
            .collect();

        EngineStatus {
            state: self.inner.state(),
            generation: snapshot.as_ref().map(|s| s.generation()),
            entry_count: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            categories,
        }
    }

    /// 수동 위치 등록 (상대 경로는 base_url 기준, 중복이면 false)
    ///
    /// 다음 리프레시부터 적용됩니다.
    pub fn add_location(&self, category: Category, location: &str) -> Result<bool> {
        let url = resolve_location(&self.inner.config.base_url, location)?;
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if registry
            .get(category)
            .map(|s| s.seeds.contains(&url))
            .unwrap_or(false)
        {
            return Ok(false);
        }
        if !self
            .inner
            .archive
            .add_location(category, &url)
            .map_err(KnowledgeError::storage)?
        {
            return Ok(false);
        }
        registry.add_location(category, &url);
        tracing::info!("Added location {} to {}", url, category);
        Ok(true)
    }

    /// 수동 위치 제거 (등록되지 않은 위치면 false)
    pub fn remove_location(&self, category: Category, location: &str) -> Result<bool> {
        let url = resolve_location(&self.inner.config.base_url, location)?;
        let removed = self
            .inner
            .archive
            .remove_location(category, &url)
            .map_err(KnowledgeError::storage)?;
        if removed {
            self.inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_location(category, &url);
            tracing::info!("Removed location {} from {}", url, category);
        }
        Ok(removed)
    }
}

// ============================================================================
// Inner
// ============================================================================

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> EngineState {
        *self.lock_state()
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.lock_state();
        if *state != next {
            tracing::debug!("Engine state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// 종료 중이 아닐 때만 상태 전이 (전이했으면 true)
    fn advance_state(&self, next: EngineState) -> bool {
        let mut state = self.lock_state();
        if matches!(*state, EngineState::ShuttingDown | EngineState::Stopped) {
            return false;
        }
        if *state != next {
            tracing::debug!("Engine state {} -> {}", *state, next);
            *state = next;
        }
        true
    }

    fn current(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 포인터 교체만 쓰기 잠금 안에서
    fn install(&self, snapshot: IndexSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// 저장된 스냅샷 로드 (손상/차원 불일치면 None)
    async fn load_persisted(&self) -> Option<IndexSnapshot> {
        match self.store.load(&Category::all()).await {
            Ok(Some(snapshot)) => {
                let expected = self.builder.embedder().dimension();
                if !snapshot.is_empty() && snapshot.dimension() != expected {
                    tracing::warn!(
                        "Persisted index dimension {} differs from embedder dimension {}, rebuilding",
                        snapshot.dimension(),
                        expected
                    );
                    return None;
                }
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Ignoring persisted index: {}", e);
                None
            }
        }
    }

    /// 우선순위 순 카테고리 (필터가 있으면 그 안에서)
    fn ordered_categories(&self, only: Option<&BTreeSet<Category>>) -> Vec<Category> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_priority()
            .into_iter()
            .map(|s| s.category)
            .filter(|c| only.map(|set| set.contains(c)).unwrap_or(true))
            .collect()
    }

    /// 카테고리의 다음 리프레시 시각
    ///
    /// 마지막 시도가 실패했으면 실패 시각 + retry_delay.
    fn due_at(&self, category: Category, snapshot: Option<&IndexSnapshot>) -> DateTime<Utc> {
        if let Some(failed) = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
        {
            return *failed + to_chrono(self.config.retry_delay());
        }

        let interval = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category)
            .map(|s| s.refresh_interval)
            .unwrap_or_else(|| Duration::from_secs(self.config.refresh_interval_secs));

        match snapshot.and_then(|s| s.refreshed_at().get(&category)) {
            Some(at) => *at + to_chrono(interval),
            None => DateTime::<Utc>::MIN_UTC,
        }
    }

    fn due_categories(&self, now: DateTime<Utc>) -> BTreeSet<Category> {
        let snapshot = self.current();
        Category::all()
            .into_iter()
            .filter(|c| self.due_at(*c, snapshot.as_deref()) <= now)
            .collect()
    }

    fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let snapshot = self.current();
        Category::all()
            .into_iter()
            .map(|c| self.due_at(c, snapshot.as_deref()))
            .min()
            .and_then(|due| (due - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
            .max(MIN_SLEEP)
    }

    /// 이번 사이클의 카테고리 위치 (시드 + 사이트맵, 순서 유지 중복 제거)
    fn locations_for(&self, category: Category, discovered: &BTreeMap<Category, Vec<String>>) -> Vec<String> {
        let seeds = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category)
            .map(|s| s.seeds.clone())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        seeds
            .into_iter()
            .chain(discovered.get(&category).cloned().unwrap_or_default())
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    /// 사이트맵 탐색 (실패는 로그만)
    async fn discover(&self, categories: &[Category]) -> BTreeMap<Category, Vec<String>> {
        let Some(sitemap_url) = self.config.sitemap_url.as_deref() else {
            return BTreeMap::new();
        };
        if !categories.iter().any(|c| !c.is_ranking()) {
            return BTreeMap::new();
        }

        let fetch = tokio::time::timeout(
            self.config.acquisition_timeout(),
            self.acquirer.discover(sitemap_url),
        );
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return BTreeMap::new(),
            outcome = fetch => outcome,
        };

        match outcome {
            Ok(Ok(entries)) => group_by_category(&entries, &self.config.base_url),
            Ok(Err(e)) => {
                tracing::warn!("Sitemap discovery failed: {:#}", e);
                BTreeMap::new()
            }
            Err(_) => {
                tracing::warn!("Sitemap discovery timed out");
                BTreeMap::new()
            }
        }
    }

    /// 카테고리 하나 수집 → 정규화
    async fn acquire(&self, category: Category, locations: &[String]) -> Result<Vec<Document>> {
        let fetch = tokio::time::timeout(
            self.config.acquisition_timeout(),
            self.acquirer.acquire(category, locations),
        );
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(KnowledgeError::Cancelled),
            outcome = fetch => outcome,
        };

        let raws = match outcome {
            Err(_) => return Err(KnowledgeError::AcquisitionTimeout { category }),
            Ok(Err(e)) => {
                return Err(KnowledgeError::Acquisition {
                    category,
                    reason: format!("{:#}", e),
                })
            }
            Ok(Ok(raws)) => raws,
        };

        let documents: Vec<Document> = raws.iter().flat_map(|raw| normalize(raw, category)).collect();
        if documents.is_empty() {
            return Err(KnowledgeError::Acquisition {
                category,
                reason: "no usable content".to_string(),
            });
        }
        Ok(documents)
    }

    /// 보관소 → 백업 파일 순 폴백 문서
    fn fallback_documents(&self, category: Category) -> Option<Vec<Document>> {
        match self.archive.documents_for(category) {
            Ok(docs) if !docs.is_empty() => {
                tracing::info!("Using {} archived documents for {}", docs.len(), category);
                return Some(docs);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to read archive for {}: {:#}", category, e),
        }

        match self.backup.load(category) {
            Ok(raws) => {
                let docs: Vec<Document> = raws.iter().flat_map(|raw| normalize(raw, category)).collect();
                (!docs.is_empty()).then_some(docs)
            }
            Err(e) => {
                tracing::warn!("Failed to read backup for {}: {:#}", category, e);
                None
            }
        }
    }

    fn chunk_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .iter()
            .enumerate()
            .flat_map(|(ordinal, doc)| self.chunker.chunk(doc, ordinal))
            .collect()
    }

    fn record_failure(&self, category: Category, failed: bool) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failed {
            failures.insert(category, Utc::now());
        } else {
            failures.remove(&category);
        }
    }

    /// 리프레시 사이클 (단일 writer)
    async fn refresh(&self, categories: Vec<Category>, first_build: bool) -> Result<RefreshReport> {
        let _writer = self.writer.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(KnowledgeError::Cancelled);
        }
        if !first_build {
            self.advance_state(EngineState::Refreshing);
        }

        let result = self.refresh_locked(&categories, first_build).await;

        if !first_build {
            self.advance_state(EngineState::Ready);
        }
        result
    }

    async fn refresh_locked(&self, categories: &[Category], first_build: bool) -> Result<RefreshReport> {
        tracing::info!("Refreshing {} categories", categories.len());
        let base = self.current();
        let discovered = self.discover(categories).await;

        let mut report = RefreshReport::default();
        let mut chunks = Vec::new();
        let mut replaced = BTreeSet::new();
        let mut acquired: Vec<(Category, Vec<Document>)> = Vec::new();

        for &category in categories {
            if self.shutdown.is_cancelled() {
                return Err(KnowledgeError::Cancelled);
            }

            let locations = self.locations_for(category, &discovered);
            match self.acquire(category, &locations).await {
                Ok(documents) => {
                    tracing::debug!("Acquired {} documents for {}", documents.len(), category);
                    chunks.extend(self.chunk_documents(&documents));
                    replaced.insert(category);
                    report.succeeded.push(category);
                    acquired.push((category, documents));
                    self.record_failure(category, false);
                }
                Err(KnowledgeError::Cancelled) => return Err(KnowledgeError::Cancelled),
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.failed.push(CategoryFailure {
                        category,
                        reason: e.to_string(),
                    });
                    self.record_failure(category, true);

                    if base.as_ref().map(|s| s.has_category(category)).unwrap_or(false) {
                        report.retained.push(category);
                    } else if let Some(documents) = self.fallback_documents(category) {
                        chunks.extend(self.chunk_documents(&documents));
                        replaced.insert(category);
                        report.retained.push(category);
                    }
                }
            }
        }

        if report.succeeded.is_empty() && !report.failed.is_empty() {
            for &category in categories {
                let has_content = replaced.contains(&category)
                    || base.as_ref().map(|s| s.has_category(category)).unwrap_or(false);
                if has_content {
                    continue;
                }
                let documents = default_documents(category);
                if documents.is_empty() {
                    continue;
                }
                tracing::warn!("Falling back to built-in documents for {}", category);
                chunks.extend(self.chunk_documents(&documents));
                replaced.insert(category);
                report.defaulted.push(category);
            }
        }

        if replaced.is_empty() {
            if first_build {
                return Err(KnowledgeError::NoUsableIndex(
                    "no category could be acquired and no fallback content exists".to_string(),
                ));
            }
            tracing::info!("Refresh produced no changes");
            report.generation = base.as_ref().map(|s| s.generation());
            report.entry_count = base.as_ref().map(|s| s.len()).unwrap_or(0);
            return Ok(report);
        }

        let build = self.builder.replace_categories(base.as_deref(), &replaced, chunks);
        let snapshot = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(KnowledgeError::Cancelled),
            built = build => built,
        }
        .map_err(|e| {
            if first_build {
                KnowledgeError::NoUsableIndex(e.to_string())
            } else {
                e
            }
        })?;

        if first_build && snapshot.is_empty() {
            return Err(KnowledgeError::NoUsableIndex("index has no entries".to_string()));
        }

        if let Err(e) = self.store.persist(&snapshot, &replaced).await {
            tracing::error!("Failed to persist index: {:#}", e);
        }
        for (category, documents) in &acquired {
            if let Err(e) = self.archive.replace_category(*category, documents) {
                tracing::warn!("Failed to archive {}: {:#}", category, e);
            }
        }

        report.generation = Some(snapshot.generation());
        report.entry_count = snapshot.len();
        tracing::info!(
            "Refresh complete: generation {}, {} entries ({} ok, {} failed)",
            snapshot.generation(),
            snapshot.len(),
            report.succeeded.len(),
            report.failed.len()
        );
        self.install(snapshot);
        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// 백그라운드 리프레시 루프
///
/// 가장 이른 예정 시각까지 잠들고, 잠금은 잡지 않습니다.
async fn run_refresh_loop(inner: Arc<Inner>) {
    let mut delay = inner.next_delay(Utc::now());

    loop {
        tracing::debug!("Next refresh check in {:?}", delay);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let due = inner.due_categories(Utc::now());
        if due.is_empty() {
            delay = inner.next_delay(Utc::now());
            continue;
        }

        let categories = inner.ordered_categories(Some(&due));
        match inner.refresh(categories, false).await {
            Ok(_) => delay = inner.next_delay(Utc::now()),
            Err(KnowledgeError::Cancelled) => break,
            Err(e) => {
                tracing::error!("Scheduled refresh failed: {}", e);
                delay = inner.config.retry_delay().max(MIN_SLEEP);
            }
        }
    }

    tracing::debug!("Refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryOverride;
    use crate::embedding::HashingEmbedding;
    use crate::knowledge::RawContent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// 카테고리별 응답을 지정하는 수집기 (미지정 카테고리는 실패)
    #[derive(Default)]
    struct ScriptedAcquirer {
        pages: Mutex<HashMap<Category, Vec<RawContent>>>,
        /// 응답하지 않는 카테고리
        hanging: Mutex<HashSet<Category>>,
        hung: Notify,
        calls: AtomicUsize,
    }

    impl ScriptedAcquirer {
        fn set(&self, category: Category, body: &str, origin: &str) {
            self.pages
                .lock()
                .expect("lock")
                .insert(category, vec![RawContent::text(body, origin)]);
        }

        fn fail(&self, category: Category) {
            self.pages.lock().expect("lock").remove(&category);
        }

        fn hang(&self, category: Category) {
            self.hanging.lock().expect("lock").insert(category);
        }
    }

    #[async_trait]
    impl Acquirer for ScriptedAcquirer {
        async fn acquire(&self, category: Category, _locations: &[String]) -> anyhow::Result<Vec<RawContent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let hangs = self.hanging.lock().expect("lock").contains(&category);
            if hangs {
                self.hung.notify_one();
                std::future::pending::<()>().await;
            }
            match self.pages.lock().expect("lock").get(&category) {
                Some(pages) => Ok(pages.clone()),
                None => anyhow::bail!("offline"),
            }
        }
    }

    /// 열고 닫을 수 있는 임베더 (문서 임베딩만 막음)
    struct GatedEmbedding {
        inner: HashingEmbedding,
        closed: AtomicBool,
        broken: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedEmbedding {
        fn new() -> Self {
            Self {
                inner: HashingEmbedding::new(64).expect("embedder"),
                closed: AtomicBool::new(false),
                broken: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbedding {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("provider down");
            }
            if self.closed.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    fn test_config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            sitemap_url: None,
            ..EngineConfig::default()
        };
        config.acquisition.timeout_secs = 5;
        config.acquisition.request_timeout_secs = 5;
        config.acquisition.retry_delay_secs = 3600;
        config.embedding.dimension = 64;
        config
    }

    fn engine_with(
        dir: &TempDir,
        acquirer: Arc<ScriptedAcquirer>,
        embedder: Arc<GatedEmbedding>,
    ) -> KnowledgeEngine {
        KnowledgeEngine::new(test_config(dir), embedder, acquirer).expect("engine")
    }

    async fn news_manifest(dir: &TempDir) -> Option<Uuid> {
        SnapshotStore::new(dir.path().join("index"))
            .manifest(Category::News)
            .await
            .expect("manifest")
            .map(|m| m.generation)
    }

    fn contents(result: &QueryResult) -> Vec<String> {
        result.hits.iter().map(|h| h.content.clone()).collect()
    }

    #[tokio::test]
    async fn test_query_before_start_is_not_ready() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine_with(&dir, Arc::default(), Arc::new(GatedEmbedding::new()));

        assert_eq!(engine.state(), EngineState::Uninitialized);
        let err = engine
            .query(&QueryRequest::new("qualquer coisa", 3))
            .await
            .expect_err("not ready");
        assert!(matches!(err, KnowledgeError::NotReady));
        assert!(matches!(engine.refresh_now().await, Err(KnowledgeError::NotReady)));
    }

    #[tokio::test]
    async fn test_maintenance_scenario() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(
            Category::News,
            "Server maintenance on 10/05/2025. Shop is closed.",
            "https://www.neogames.online/news/maintenance",
        );
        let engine = engine_with(&dir, acquirer, Arc::new(GatedEmbedding::new()));
        engine.start().await.expect("start");
        assert_eq!(engine.state(), EngineState::Ready);

        let news = engine
            .ask("When is the maintenance?", Some(&[Category::News]))
            .await
            .expect("query");
        assert_eq!(news.len(), 1);
        assert!(news.hits[0].content.contains("10/05/2025"));
        assert_eq!(
            news.hits[0].acquired_at.format("%Y-%m-%d").to_string(),
            "2025-05-10"
        );

        let shop = engine
            .ask("When is the maintenance?", Some(&[Category::Shop]))
            .await
            .expect("query");
        assert!(shop.is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_category_keeps_previous_content() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Evento de natal começa hoje.", "https://n/1");
        acquirer.set(Category::Faq, "Para recuperar a senha use o painel.", "https://f/1");
        let engine = engine_with(&dir, Arc::clone(&acquirer), Arc::new(GatedEmbedding::new()));
        engine.start().await.expect("start");

        acquirer.fail(Category::Faq);
        acquirer.set(Category::News, "Evento de ano novo começa amanhã.", "https://n/2");
        let report = engine.refresh_now().await.expect("refresh");

        assert!(report.succeeded.contains(&Category::News));
        assert!(report.failed.iter().any(|f| f.category == Category::Faq));
        assert!(report.retained.contains(&Category::Faq));
        assert!(report.defaulted.is_empty());

        let faq = engine.ask("senha", Some(&[Category::Faq])).await.expect("query");
        assert!(contents(&faq)[0].contains("recuperar a senha"));

        let news = engine.ask("evento", Some(&[Category::News])).await.expect("query");
        assert_eq!(contents(&news), vec!["Evento de ano novo começa amanhã.".to_string()]);

        let status = engine.status();
        let faq_status = status
            .categories
            .iter()
            .find(|c| c.category == Category::Faq)
            .expect("faq status");
        assert!(faq_status.failed_at.is_some());
        assert_eq!(faq_status.entries, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_queries_see_old_snapshot_during_refresh() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Servidor em manutenção amanhã.", "https://n/1");
        let embedder = Arc::new(GatedEmbedding::new());
        let engine = engine_with(&dir, Arc::clone(&acquirer), Arc::clone(&embedder));
        engine.start().await.expect("start");
        let before = engine.snapshot().expect("snapshot");

        acquirer.set(Category::News, "Evento de drop duplo neste fim de semana.", "https://n/2");
        embedder.closed.store(true, Ordering::SeqCst);

        let refreshing = engine.clone();
        let handle = tokio::spawn(async move { refreshing.refresh_now().await });
        embedder.entered.notified().await;

        assert_eq!(engine.state(), EngineState::Refreshing);
        let during = engine.ask("manutenção", None).await.expect("query");
        assert!(contents(&during).iter().any(|c| c.contains("manutenção")));
        assert!(!contents(&during).iter().any(|c| c.contains("drop duplo")));

        embedder.closed.store(false, Ordering::SeqCst);
        embedder.release.notify_one();
        handle.await.expect("join").expect("refresh");

        let after = engine.ask("drop duplo", None).await.expect("query");
        assert!(contents(&after).iter().any(|c| c.contains("drop duplo")));
        assert!(!contents(&after).iter().any(|c| c.contains("manutenção")));

        // 이전 스냅샷은 그대로
        assert_ne!(engine.snapshot().expect("snapshot").generation(), before.generation());
        assert!(before.entries().iter().any(|e| e.chunk.content.contains("manutenção")));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_failing_uses_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine_with(&dir, Arc::default(), Arc::new(GatedEmbedding::new()));
        engine.start().await.expect("start");

        let snapshot = engine.snapshot().expect("snapshot");
        assert!(snapshot.has_category(Category::System));
        assert!(snapshot.has_category(Category::Main));
        assert!(!snapshot.has_category(Category::News));

        let result = engine.ask("classes", Some(&[Category::System])).await.expect("query");
        assert!(!result.is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_build_failure_is_fatal() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Notícia qualquer.", "https://n/1");
        let embedder = Arc::new(GatedEmbedding::new());
        embedder.broken.store(true, Ordering::SeqCst);
        let engine = engine_with(&dir, acquirer, embedder);

        let err = engine.start().await.expect_err("fatal");
        assert!(matches!(err, KnowledgeError::NoUsableIndex(_)));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(
            engine.ask("x", None).await,
            Err(KnowledgeError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_restart_loads_persisted_snapshot() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::Faq, "O servidor fica em São Paulo.", "https://f/1");
        let first = engine_with(&dir, Arc::clone(&acquirer), Arc::new(GatedEmbedding::new()));
        first.start().await.expect("start");
        let entries = first.snapshot().expect("snapshot").len();
        first.shutdown().await;
        assert_eq!(first.state(), EngineState::Stopped);
        assert!(first.snapshot().is_none());

        let offline = Arc::new(ScriptedAcquirer::default());
        let second = engine_with(&dir, Arc::clone(&offline), Arc::new(GatedEmbedding::new()));
        second.start().await.expect("restart");
        assert_eq!(offline.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.snapshot().expect("snapshot").len(), entries);

        let result = second.ask("servidor", Some(&[Category::Faq])).await.expect("query");
        assert_eq!(result.len(), 1);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_archive_fallback_after_index_loss() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::Faq, "Recarga via PIX disponível.", "https://f/1");
        let first = engine_with(&dir, acquirer, Arc::new(GatedEmbedding::new()));
        first.start().await.expect("start");
        first.shutdown().await;

        std::fs::remove_dir_all(dir.path().join("index")).expect("remove index");

        let second = engine_with(&dir, Arc::default(), Arc::new(GatedEmbedding::new()));
        second.start().await.expect("restart");
        let result = second.ask("PIX", Some(&[Category::Faq])).await.expect("query");
        assert_eq!(contents(&result), vec!["Recarga via PIX disponível.".to_string()]);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_locations() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine_with(&dir, Arc::default(), Arc::new(GatedEmbedding::new()));

        assert!(engine.add_location(Category::News, "news/asa-arcana").expect("add"));
        assert!(!engine
            .add_location(Category::News, "https://www.neogames.online/news/asa-arcana")
            .expect("duplicate"));
        // 기본 시드와 같은 위치
        assert!(!engine.add_location(Category::Shop, "/shop").expect("seed"));

        let news = engine
            .sources()
            .into_iter()
            .find(|s| s.category == Category::News)
            .expect("news source");
        assert!(news
            .seeds
            .contains(&"https://www.neogames.online/news/asa-arcana".to_string()));
        assert_eq!(engine.archive().locations().expect("locations").len(), 1);

        assert!(engine.remove_location(Category::News, "/news/asa-arcana").expect("remove"));
        assert!(!engine.remove_location(Category::News, "/news/asa-arcana").expect("again"));
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Nova temporada de guerra.", "https://n/1");
        let engine = engine_with(&dir, Arc::clone(&acquirer), Arc::new(GatedEmbedding::new()));
        engine.start().await.expect("start");
        engine.shutdown().await;

        assert!(matches!(engine.start().await, Err(KnowledgeError::Cancelled)));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.snapshot().is_none());

        let never_started = engine_with(&dir, acquirer, Arc::new(GatedEmbedding::new()));
        never_started.shutdown().await;
        assert!(matches!(never_started.start().await, Err(KnowledgeError::Cancelled)));
        assert_eq!(never_started.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_during_first_build() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Manutenção semanal às quartas.", "https://n/1");
        let embedder = Arc::new(GatedEmbedding::new());
        embedder.closed.store(true, Ordering::SeqCst);
        let engine = engine_with(&dir, acquirer, Arc::clone(&embedder));

        let starting = engine.clone();
        let handle = tokio::spawn(async move { starting.start().await });
        embedder.entered.notified().await;

        engine.shutdown().await;
        let started = handle.await.expect("join");
        assert!(matches!(started, Err(KnowledgeError::Cancelled)));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.snapshot().is_none());
        assert!(news_manifest(&dir).await.is_none());
    }

    #[tokio::test]
    async fn test_hanging_category_times_out_others_refresh() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Evento de páscoa ativo.", "https://n/1");
        acquirer.set(Category::Faq, "O limite de personagens é 6.", "https://f/1");

        let mut config = test_config(&dir);
        config.acquisition.timeout_secs = 1;
        config.acquisition.request_timeout_secs = 1;
        let engine = KnowledgeEngine::new(
            config,
            Arc::new(GatedEmbedding::new()),
            Arc::clone(&acquirer) as Arc<dyn Acquirer>,
        )
        .expect("engine");
        engine.start().await.expect("start");

        acquirer.hang(Category::Faq);
        acquirer.set(Category::News, "Evento de verão ativo.", "https://n/2");
        let report = engine.refresh_now().await.expect("refresh");

        assert!(report.succeeded.contains(&Category::News));
        let faq = report
            .failed
            .iter()
            .find(|f| f.category == Category::Faq)
            .expect("faq failure");
        assert_eq!(
            faq.reason,
            KnowledgeError::AcquisitionTimeout { category: Category::Faq }.to_string()
        );
        assert!(report.retained.contains(&Category::Faq));

        let news = engine.ask("evento", Some(&[Category::News])).await.expect("query");
        assert_eq!(contents(&news), vec!["Evento de verão ativo.".to_string()]);
        let faq = engine.ask("personagens", Some(&[Category::Faq])).await.expect("query");
        assert!(contents(&faq)[0].contains("limite de personagens"));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_acquisition() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Torneio de guildas no sábado.", "https://n/1");
        let engine = engine_with(&dir, Arc::clone(&acquirer), Arc::new(GatedEmbedding::new()));
        engine.start().await.expect("start");
        let before = engine.snapshot().expect("snapshot");
        let persisted = news_manifest(&dir).await;

        acquirer.hang(Category::News);
        let refreshing = engine.clone();
        let handle = tokio::spawn(async move { refreshing.refresh_now().await });
        acquirer.hung.notified().await;

        // 수집 제한 시간(5초)보다 훨씬 먼저 끝나야 함
        tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
            .await
            .expect("shutdown returns promptly");
        let refreshed = handle.await.expect("join");
        assert!(matches!(refreshed, Err(KnowledgeError::Cancelled)));

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(news_manifest(&dir).await, persisted);
        assert!(before.entries().iter().any(|e| e.chunk.content.contains("Torneio")));
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_live_and_persisted_snapshot() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Drop de itens raros dobrado.", "https://n/1");
        let embedder = Arc::new(GatedEmbedding::new());
        let engine = engine_with(&dir, Arc::clone(&acquirer), Arc::clone(&embedder));
        engine.start().await.expect("start");
        let generation = engine.snapshot().expect("snapshot").generation();
        let persisted = news_manifest(&dir).await;
        assert_eq!(persisted, Some(generation));

        acquirer.set(Category::News, "Experiência triplicada no fim de semana.", "https://n/2");
        embedder.broken.store(true, Ordering::SeqCst);
        let err = engine.refresh_now().await.expect_err("embedding failure");
        assert!(matches!(err, KnowledgeError::Embedding(_)));

        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.snapshot().expect("snapshot").generation(), generation);
        assert_eq!(news_manifest(&dir).await, persisted);
        let news = engine.ask("drop", Some(&[Category::News])).await.expect("query");
        assert_eq!(contents(&news), vec!["Drop de itens raros dobrado.".to_string()]);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_loop_fires_when_category_is_due() {
        let dir = TempDir::new().expect("temp dir");
        let acquirer = Arc::new(ScriptedAcquirer::default());
        acquirer.set(Category::News, "Servidor reinicia às 6h.", "https://n/1");

        let mut config = test_config(&dir);
        config.categories.insert(
            Category::News.key(),
            CategoryOverride {
                refresh_interval_secs: Some(1),
                ..CategoryOverride::default()
            },
        );
        let engine = KnowledgeEngine::new(
            config,
            Arc::new(GatedEmbedding::new()),
            Arc::clone(&acquirer) as Arc<dyn Acquirer>,
        )
        .expect("engine");
        engine.start().await.expect("start");
        let first = engine.snapshot().expect("snapshot").generation();

        acquirer.set(Category::News, "Servidor reinicia às 8h.", "https://n/2");
        let mut refreshed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = engine.snapshot().expect("snapshot");
            if current.generation() != first
                && current.entries().iter().any(|e| e.chunk.content.contains("8h"))
            {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed, "scheduled refresh did not run");

        engine.shutdown().await;
    }
}
