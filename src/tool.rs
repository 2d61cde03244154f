//! 대화 에이전트용 도구 경계
//!
//! 엔진 결과를 사람이 읽는 텍스트로 바꾸는 유일한 곳입니다.
//! 에러는 여기서만 안내 문구로 변환됩니다.

use crate::error::KnowledgeError;
use crate::knowledge::{Category, KnowledgeEngine, QueryHit, QueryResult, RankingPartition};

pub const NO_INFORMATION: &str = "Nenhuma informação relevante encontrada.";
pub const UNAVAILABLE: &str =
    "Base de conhecimento temporariamente indisponível. Por favor, tente novamente mais tarde.";
pub const INITIALIZING: &str = "Base de conhecimento não inicializada.";

/// 이름 붙은 검색 도구
#[derive(Clone)]
pub struct KnowledgeTool {
    engine: KnowledgeEngine,
    name: &'static str,
    description: &'static str,
    /// None이면 전체 카테고리
    categories: Option<Vec<Category>>,
}

impl KnowledgeTool {
    /// 사이트 섹션 전용 (뉴스, FAQ, 상점 등)
    pub fn site_knowledge(engine: KnowledgeEngine) -> Self {
        Self {
            engine,
            name: "site_knowledge",
            description: "Consulta informações do site do servidor: notícias, eventos, FAQ, \
                          loja, recarga, VIP, downloads e sistemas do jogo.",
            categories: Some(Category::SITE.to_vec()),
        }
    }

    /// 랭킹 전용
    pub fn ranking_knowledge(engine: KnowledgeEngine) -> Self {
        Self {
            engine,
            name: "ranking_knowledge",
            description: "Consulta os rankings do servidor: poder geral e por classe, \
                          guildas e memorial.",
            categories: Some(Category::rankings()),
        }
    }

    /// 전체 카테고리
    pub fn combined_knowledge(engine: KnowledgeEngine) -> Self {
        Self {
            engine,
            name: "combined_knowledge",
            description: "Consulta todas as fontes de conhecimento disponíveis. Use quando \
                          não tiver certeza de qual fonte usar.",
            categories: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn description(&self) -> &str {
        self.description
    }

    /// 질문에 대한 답변 텍스트
    ///
    /// `filter`가 주어지면 도구 기본 범위 대신 사용합니다.
    pub async fn ask(&self, question: &str, filter: Option<&[Category]>) -> String {
        let categories = filter.or(self.categories.as_deref());
        match self.engine.ask(question, categories).await {
            Ok(result) => format_result(&result),
            Err(KnowledgeError::NotReady) => INITIALIZING.to_string(),
            Err(e) => {
                tracing::error!("{} query failed: {}", self.name, e);
                UNAVAILABLE.to_string()
            }
        }
    }
}

/// 결과 전체 포맷 (항목 사이 빈 줄)
pub fn format_result(result: &QueryResult) -> String {
    if result.is_empty() {
        return NO_INFORMATION.to_string();
    }
    result
        .hits
        .iter()
        .map(format_hit)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 항목 하나: 헤더 + 내용 + (URL이면) 출처
pub fn format_hit(hit: &QueryHit) -> String {
    let mut out = format!("{} {}", header(hit), hit.content.trim());
    if hit.origin_url.starts_with("http://") || hit.origin_url.starts_with("https://") {
        out.push_str("\nFonte: ");
        out.push_str(&hit.origin_url);
    }
    out
}

fn header(hit: &QueryHit) -> String {
    match hit.category {
        Category::News => format!("[Notícia - {}]", hit.acquired_at.format("%d/%m/%Y")),
        Category::System => "[Sistema do Jogo]".to_string(),
        Category::Ranking(RankingPartition::Power(Some(class))) => {
            format!("[Ranking POWER - {}]", class.abbr())
        }
        Category::Ranking(RankingPartition::Power(None)) => "[Ranking POWER]".to_string(),
        Category::Ranking(RankingPartition::Guild) => "[Ranking GUILD]".to_string(),
        Category::Ranking(RankingPartition::Memorial) => "[Ranking MEMORIAL]".to_string(),
        other => {
            let key = other.key();
            let mut chars = key.chars();
            match chars.next() {
                Some(first) => format!("[{}{}]", first.to_uppercase(), chars.as_str()),
                None => "[]".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::embedding::HashingEmbedding;
    use crate::knowledge::{CharacterClass, ChunkId, RawContent, SearchMethod};
    use crate::scraper::Acquirer;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn hit(category: Category, content: &str, origin: &str) -> QueryHit {
        QueryHit {
            id: ChunkId::from_hex(format!("{:064x}", 1)),
            content: content.to_string(),
            category,
            origin_url: origin.to_string(),
            acquired_at: Utc.with_ymd_and_hms(2025, 5, 10, 0, 0, 0).unwrap(),
            score: 0.03,
            method: SearchMethod::Hybrid,
        }
    }

    /// 뉴스만 응답하는 수집기
    struct NewsOnly;

    #[async_trait]
    impl Acquirer for NewsOnly {
        async fn acquire(&self, category: Category, _locations: &[String]) -> anyhow::Result<Vec<RawContent>> {
            match category {
                Category::News => Ok(vec![RawContent::text(
                    "Server maintenance on 10/05/2025. Shop is closed.",
                    "https://www.neogames.online/news/maintenance",
                )]),
                _ => anyhow::bail!("offline"),
            }
        }
    }

    fn engine(dir: &TempDir) -> KnowledgeEngine {
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            sitemap_url: None,
            ..EngineConfig::default()
        };
        let embedder = Arc::new(HashingEmbedding::new(64).expect("embedder"));
        KnowledgeEngine::new(config, embedder, Arc::new(NewsOnly)).expect("engine")
    }

    #[test]
    fn test_headers() {
        let news = format_hit(&hit(Category::News, "Manutenção", "https://x/news/1"));
        assert_eq!(news, "[Notícia - 10/05/2025] Manutenção\nFonte: https://x/news/1");

        let system = format_hit(&hit(Category::System, "Classes", "builtin:system"));
        assert_eq!(system, "[Sistema do Jogo] Classes");

        let ranking = format_hit(&hit(
            Category::Ranking(RankingPartition::Power(Some(CharacterClass::ForceArcher))),
            "Rank: 1",
            "https://x/ranking/power?classId=4",
        ));
        assert!(ranking.starts_with("[Ranking POWER - "));

        let faq = format_hit(&hit(Category::Faq, "Resposta", "backup:faq/a.md"));
        assert_eq!(faq, "[Faq] Resposta");
    }

    #[test]
    fn test_empty_result_sentinel() {
        assert_eq!(format_result(&QueryResult::default()), NO_INFORMATION);
    }

    #[test]
    fn test_hits_joined_by_blank_line() {
        let result = QueryResult {
            hits: vec![
                hit(Category::Shop, "A", "builtin:shop"),
                hit(Category::Vip, "B", "builtin:vip"),
            ],
        };
        assert_eq!(format_result(&result), "[Shop] A\n\n[Vip] B");
    }

    #[tokio::test]
    async fn test_not_ready_sentinel() {
        let dir = TempDir::new().expect("temp dir");
        let tool = KnowledgeTool::combined_knowledge(engine(&dir));
        assert_eq!(tool.ask("qualquer", None).await, INITIALIZING);
    }

    #[tokio::test]
    async fn test_presets_scope_categories() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        engine.start().await.expect("start");

        let site = KnowledgeTool::site_knowledge(engine.clone());
        let answer = site.ask("When is the maintenance?", None).await;
        assert!(answer.starts_with("[Notícia - 10/05/2025]"));
        assert!(answer.ends_with("Fonte: https://www.neogames.online/news/maintenance"));

        let rankings = KnowledgeTool::ranking_knowledge(engine.clone());
        assert_eq!(rankings.name(), "ranking_knowledge");
        assert_eq!(rankings.ask("When is the maintenance?", None).await, NO_INFORMATION);

        let shop = site.ask("maintenance", Some(&[Category::Shop])).await;
        assert_eq!(shop, NO_INFORMATION);

        engine.shutdown().await;
    }
}
