//! 카테고리 - 사이트 섹션과 랭킹 파티션의 닫힌 열거형
//!
//! 각 카테고리는 안정적인 문자열 키(`news`, `ranking/power/ea` 등)를 가지며,
//! 이 키는 디스크 상의 상대 경로로도 사용됩니다.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::rankings::CharacterClass;
use crate::error::KnowledgeError;

// ============================================================================
// RankingPartition
// ============================================================================

/// 랭킹 파티션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RankingPartition {
    /// 파워 랭킹 (None = 전체)
    Power(Option<CharacterClass>),
    Guild,
    Memorial,
}

// ============================================================================
// Category
// ============================================================================

/// 지식 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Main,
    News,
    Faq,
    Download,
    System,
    Shop,
    Recharge,
    Vip,
    Ranking(RankingPartition),
}

impl Category {
    /// 사이트 섹션 카테고리
    pub const SITE: [Category; 8] = [
        Category::Main,
        Category::News,
        Category::Faq,
        Category::Download,
        Category::System,
        Category::Shop,
        Category::Recharge,
        Category::Vip,
    ];

    /// 전체 랭킹 카테고리 (전체 파워, 클래스별 파워, 길드, 메모리얼)
    pub fn rankings() -> Vec<Category> {
        let mut out = vec![Category::Ranking(RankingPartition::Power(None))];
        out.extend(
            CharacterClass::ALL
                .into_iter()
                .map(|c| Category::Ranking(RankingPartition::Power(Some(c)))),
        );
        out.push(Category::Ranking(RankingPartition::Guild));
        out.push(Category::Ranking(RankingPartition::Memorial));
        out
    }

    /// 모든 카테고리
    pub fn all() -> Vec<Category> {
        let mut out = Self::SITE.to_vec();
        out.extend(Self::rankings());
        out
    }

    /// 안정 키 (디스크 상대 경로)
    pub fn key(&self) -> String {
        match self {
            Category::Main => "main".to_string(),
            Category::News => "news".to_string(),
            Category::Faq => "faq".to_string(),
            Category::Download => "download".to_string(),
            Category::System => "system".to_string(),
            Category::Shop => "shop".to_string(),
            Category::Recharge => "recharge".to_string(),
            Category::Vip => "vip".to_string(),
            Category::Ranking(RankingPartition::Power(None)) => "ranking/power/general".to_string(),
            Category::Ranking(RankingPartition::Power(Some(class))) => {
                format!("ranking/power/{}", class.abbr().to_lowercase())
            }
            Category::Ranking(RankingPartition::Guild) => "ranking/guild".to_string(),
            Category::Ranking(RankingPartition::Memorial) => "ranking/memorial".to_string(),
        }
    }

    /// 최신성이 중요한 카테고리인지 (결과를 시간 역순 정렬)
    pub fn is_time_sensitive(&self) -> bool {
        matches!(self, Category::News)
    }

    pub fn is_ranking(&self) -> bool {
        matches!(self, Category::Ranking(_))
    }

    /// 사이트 URL 경로의 첫 세그먼트로 카테고리 결정
    ///
    /// 빈 경로는 `main`, 알 수 없는 세그먼트는 None.
    pub fn from_site_path(path: &str) -> Option<Category> {
        let first = path.trim_matches('/').split('/').next().unwrap_or_default();
        match first.to_lowercase().as_str() {
            "" => Some(Category::Main),
            "news" | "noticias" => Some(Category::News),
            "faq" => Some(Category::Faq),
            "download" | "downloads" => Some(Category::Download),
            "system" | "sistema" => Some(Category::System),
            "shop" | "loja" => Some(Category::Shop),
            "recharge" | "recarga" => Some(Category::Recharge),
            "vip" => Some(Category::Vip),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Category {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().trim_matches('/').to_lowercase();
        let parts: Vec<&str> = key.split('/').collect();

        let category = match parts.as_slice() {
            ["main"] => Category::Main,
            ["news"] => Category::News,
            ["faq"] => Category::Faq,
            ["download"] => Category::Download,
            ["system"] => Category::System,
            ["shop"] => Category::Shop,
            ["recharge"] => Category::Recharge,
            ["vip"] => Category::Vip,
            ["ranking", "power"] | ["ranking", "power", "general"] => {
                Category::Ranking(RankingPartition::Power(None))
            }
            ["ranking", "power", class] => {
                let class = CharacterClass::lookup(class).ok_or_else(|| {
                    KnowledgeError::Config(format!("unknown character class: {}", class))
                })?;
                Category::Ranking(RankingPartition::Power(Some(class)))
            }
            ["ranking", "guild"] => Category::Ranking(RankingPartition::Guild),
            ["ranking", "memorial"] => Category::Ranking(RankingPartition::Memorial),
            _ => return Err(KnowledgeError::Config(format!("unknown category: {}", s))),
        };
        Ok(category)
    }
}

impl TryFrom<String> for Category {
    type Error = KnowledgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip_for_every_category() {
        for category in Category::all() {
            let parsed: Category = category.key().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert_eq!(Category::all().len(), 8 + 12);
    }

    #[test]
    fn test_ranking_keys() {
        assert_eq!(
            Category::Ranking(RankingPartition::Power(Some(CharacterClass::ForceBlader))).key(),
            "ranking/power/ea"
        );
        assert_eq!(
            "ranking/power".parse::<Category>().unwrap(),
            Category::Ranking(RankingPartition::Power(None))
        );
        assert_eq!(
            "ranking/power/fb".parse::<Category>().unwrap(),
            Category::Ranking(RankingPartition::Power(Some(CharacterClass::ForceBlader)))
        );
        assert!("ranking/power/xx".parse::<Category>().is_err());
        assert!("forum".parse::<Category>().is_err());
    }

    #[test]
    fn test_only_news_is_time_sensitive() {
        let sensitive: Vec<Category> = Category::all()
            .into_iter()
            .filter(Category::is_time_sensitive)
            .collect();
        assert_eq!(sensitive, vec![Category::News]);
    }

    #[test]
    fn test_from_site_path() {
        assert_eq!(Category::from_site_path("/"), Some(Category::Main));
        assert_eq!(Category::from_site_path("/news/2025/patch"), Some(Category::News));
        assert_eq!(Category::from_site_path("shop"), Some(Category::Shop));
        assert_eq!(Category::from_site_path("/ranking/power"), None);
    }

    #[test]
    fn test_serde_uses_key() {
        let json = serde_json::to_string(&Category::Ranking(RankingPartition::Guild)).unwrap();
        assert_eq!(json, "\"ranking/guild\"");
        let back: Category = serde_json::from_str("\"vip\"").unwrap();
        assert_eq!(back, Category::Vip);
    }
}
