//! CLI 모듈
//!
//! neo-knowledge CLI 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{resolve_location, EngineConfig, SourceRegistry};
use crate::embedding::has_api_key;
use crate::knowledge::{
    Category, DocumentArchive, EngineStatus, KnowledgeEngine, QueryRequest, RefreshReport,
    SnapshotStore,
};
use crate::tool::{format_result, KnowledgeTool};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "neo-knowledge")]
#[command(version, about = "게임 서버 지식 베이스 하이브리드 인덱스 엔진", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: <data_dir>/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 도구 프리셋
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ToolPreset {
    Site,
    Ranking,
    Combined,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 엔진 실행 (백그라운드 리프레시 + 표준입력 질문 응답)
    Serve {
        /// 질문에 사용할 도구
        #[arg(short, long, value_enum, default_value = "combined")]
        tool: ToolPreset,
    },

    /// 지식 베이스 검색
    Query {
        /// 질문
        question: String,

        /// 카테고리 필터 (여러 번 지정 가능, 예: news, ranking/power/ea)
        #[arg(short = 'C', long = "category")]
        categories: Vec<Category>,

        /// 결과 개수 (기본: 설정의 default_k)
        #[arg(short, long)]
        limit: Option<usize>,

        /// 결과를 JSON으로 출력
        #[arg(long)]
        json: bool,
    },

    /// 즉시 리프레시
    Refresh,

    /// 상태 확인
    Status,

    /// 카테고리별 수집 위치 목록
    Sources,

    /// 수동 위치 등록
    AddUrl {
        /// 카테고리 키
        category: Category,
        /// URL 또는 사이트 상대 경로
        url: String,
    },

    /// 수동 위치 제거
    RemoveUrl {
        category: Category,
        url: String,
    },

    /// 보관된 문서 목록
    Documents {
        /// 카테고리 필터
        #[arg(short = 'C', long)]
        category: Option<Category>,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    match cli.command {
        Commands::Serve { tool } => cmd_serve(config, tool).await,
        Commands::Query {
            question,
            categories,
            limit,
            json,
        } => cmd_query(config, &question, categories, limit, json).await,
        Commands::Refresh => cmd_refresh(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::Sources => cmd_sources(config),
        Commands::AddUrl { category, url } => cmd_add_url(config, category, &url),
        Commands::RemoveUrl { category, url } => cmd_remove_url(config, category, &url),
        Commands::Documents { category, limit } => cmd_documents(config, category, limit),
    }
}

/// 엔진 생성 후 시작
async fn start_engine(config: EngineConfig) -> Result<KnowledgeEngine> {
    let engine = KnowledgeEngine::from_config(config).context("엔진 생성 실패")?;
    engine.start().await.context("엔진 시작 실패")?;
    Ok(engine)
}

/// 실행 명령어 (serve)
///
/// Ctrl-C 또는 표준입력 EOF까지 실행합니다.
async fn cmd_serve(config: EngineConfig, preset: ToolPreset) -> Result<()> {
    let engine = start_engine(config).await?;
    let tool = match preset {
        ToolPreset::Site => KnowledgeTool::site_knowledge(engine.clone()),
        ToolPreset::Ranking => KnowledgeTool::ranking_knowledge(engine.clone()),
        ToolPreset::Combined => KnowledgeTool::combined_knowledge(engine.clone()),
    };

    print_status(&engine.status());
    println!("[OK] 엔진 준비 완료 ({})", tool.name());
    println!("[*] 질문을 입력하세요 (종료: Ctrl-C)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("표준입력 읽기 실패")? else {
                    break;
                };
                let question = line.trim();
                if question.is_empty() {
                    continue;
                }
                println!("{}\n", tool.ask(question, None).await);
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(
    config: EngineConfig,
    question: &str,
    categories: Vec<Category>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let k = limit.unwrap_or(config.default_k);
    let engine = start_engine(config).await?;

    let mut request = QueryRequest::new(question, k);
    if !categories.is_empty() {
        request = request.with_categories(categories);
    }

    let result = engine.query(&request).await;
    engine.shutdown().await;
    let result = result.context("검색 실패")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", format_result(&result));
    }
    Ok(())
}

/// 리프레시 명령어 (refresh)
async fn cmd_refresh(config: EngineConfig) -> Result<()> {
    let engine = start_engine(config).await?;
    println!("[*] 리프레시 중...");
    let report = engine.refresh_now().await;
    engine.shutdown().await;

    print_report(&report.context("리프레시 실패")?);
    Ok(())
}

fn print_status(status: &EngineStatus) {
    println!("[*] 상태: {}", status.state);
    if let Some(generation) = status.generation {
        println!("     세대: {}", generation);
    }
    println!("{:<24} {:>8}  {}", "카테고리", "청크", "갱신 시각");
    for category in &status.categories {
        let refreshed = category
            .refreshed_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let failed = if category.failed_at.is_some() { "  [!] 마지막 수집 실패" } else { "" };
        println!(
            "{:<24} {:>8}  {}{}",
            category.category.key(),
            category.entries,
            refreshed,
            failed
        );
    }
    println!("[OK] 인덱스: {} 청크", status.entry_count);
}

fn print_report(report: &RefreshReport) {
    println!("[OK] 리프레시 완료: {} 청크", report.entry_count);
    if let Some(generation) = report.generation {
        println!("     세대: {}", generation);
    }
    println!("     성공: {}", join_categories(&report.succeeded));
    for failure in &report.failed {
        println!("[!] 실패 {}: {}", failure.category, failure.reason);
    }
    if !report.retained.is_empty() {
        println!("     이전 콘텐츠 유지: {}", join_categories(&report.retained));
    }
    if !report.defaulted.is_empty() {
        println!("     기본 문서 사용: {}", join_categories(&report.defaulted));
    }
}

/// 상태 명령어 (status)
///
/// 엔진을 시작하지 않고 디스크 상태만 확인합니다.
async fn cmd_status(config: EngineConfig) -> Result<()> {
    println!("neo-knowledge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());
    println!("[*] 임베딩: {:?} ({} 차원)", config.embedding.kind, config.embedding.dimension);

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match DocumentArchive::open(&config.archive_path()) {
        Ok(archive) => match archive.stats() {
            Ok(stats) => {
                println!("[OK] 보관된 문서: {} 건", stats.document_count);
                println!(
                    "     총 콘텐츠: {}",
                    format_bytes(stats.total_content_bytes)
                );
            }
            Err(e) => println!("[!] 통계 조회 실패: {}", e),
        },
        Err(e) => println!("[!] 보관소 열기 실패: {}", e),
    }

    println!();
    println!("{:<24} {:>8}  {}", "카테고리", "청크", "갱신 시각");
    let store = SnapshotStore::new(config.index_dir());
    let mut total = 0;
    for category in Category::all() {
        match store.manifest(category).await {
            Ok(Some(manifest)) => {
                total += manifest.entry_count;
                println!(
                    "{:<24} {:>8}  {}",
                    category.key(),
                    manifest.entry_count,
                    manifest.timestamp.format("%Y-%m-%d %H:%M")
                );
            }
            Ok(None) => println!("{:<24} {:>8}  -", category.key(), 0),
            Err(e) => println!("{:<24} {:>8}  [!] {}", category.key(), "?", e),
        }
    }
    println!();
    println!("[OK] 인덱스: {} 청크", total);

    Ok(())
}

/// 수집 위치 목록 (sources)
fn cmd_sources(config: EngineConfig) -> Result<()> {
    let archive = DocumentArchive::open(&config.archive_path()).context("보관소 열기 실패")?;
    let manual = archive.locations().context("수동 위치 조회 실패")?;
    let registry = SourceRegistry::from_config(&config, &manual)?;

    for source in registry.by_priority() {
        println!(
            "{} (우선순위 {}, 주기 {}분)",
            source.category,
            source.priority,
            source.refresh_interval.as_secs() / 60
        );
        for seed in &source.seeds {
            println!("    {}", seed);
        }
    }
    Ok(())
}

/// 수동 위치 등록 (add-url)
fn cmd_add_url(config: EngineConfig, category: Category, location: &str) -> Result<()> {
    let url = resolve_location(&config.base_url, location)?;
    let archive = DocumentArchive::open(&config.archive_path()).context("보관소 열기 실패")?;
    let manual = archive.locations().context("수동 위치 조회 실패")?;
    let registry = SourceRegistry::from_config(&config, &manual)?;

    let known = registry
        .get(category)
        .map(|s| s.seeds.contains(&url))
        .unwrap_or(false);
    if known || !archive.add_location(category, &url).context("위치 등록 실패")? {
        println!("[!] 이미 등록된 위치: {}", url);
    } else {
        println!("[OK] {} 에 등록됨: {}", category, url);
    }
    Ok(())
}

/// 수동 위치 제거 (remove-url)
fn cmd_remove_url(config: EngineConfig, category: Category, location: &str) -> Result<()> {
    let url = resolve_location(&config.base_url, location)?;
    let archive = DocumentArchive::open(&config.archive_path()).context("보관소 열기 실패")?;

    if archive.remove_location(category, &url).context("위치 제거 실패")? {
        println!("[OK] {} 에서 제거됨: {}", category, url);
    } else {
        println!("[!] 등록되지 않은 위치: {}", url);
    }
    Ok(())
}

/// 보관 문서 목록 (documents)
fn cmd_documents(config: EngineConfig, category: Option<Category>, limit: usize) -> Result<()> {
    let archive = DocumentArchive::open(&config.archive_path()).context("보관소 열기 실패")?;
    let docs = archive
        .list_documents(limit, category)
        .context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 보관된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 보관된 문서 ({} 건):\n", docs.len());

    for doc in docs {
        println!("  [{}] {}", doc.category, truncate_text(&doc.content, 60));
        println!("        URL: {}", doc.origin_url);
        println!(
            "        {} | {} chars",
            doc.acquired_at.format("%Y-%m-%d %H:%M"),
            doc.content.chars().count()
        );
        println!();
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn join_categories(categories: &[Category]) -> String {
    if categories.is_empty() {
        return "-".to_string();
    }
    categories
        .iter()
        .map(Category::key)
        .collect::<Vec<_>>()
        .join(", ")
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
