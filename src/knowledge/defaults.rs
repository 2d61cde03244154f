//! 내장 기본 코퍼스 - 수집과 백업이 모두 없을 때의 최후 폴백

use std::collections::BTreeMap;

use chrono::Utc;

use super::category::Category;
use super::normalizer::{Document, TimestampSource};
use super::rankings::CharacterClass;

/// 기본 문서 원본 표기
pub const DEFAULT_ORIGIN_PREFIX: &str = "builtin:";

/// 카테고리의 내장 기본 문서 (없으면 빈 목록)
pub fn default_documents(category: Category) -> Vec<Document> {
    let texts: Vec<String> = match category {
        Category::System => vec![
            format!(
                "Cabal Online é um MMORPG que possui várias classes: {}.",
                CharacterClass::ALL
                    .iter()
                    .map(|c| format!("{} ({})", c.name_pt(), c.name_en()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            "O jogo possui diversos sistemas como crafting, enhancement, dungeons, PvP e \
             Guerra entre Nações (Procion e Capella)."
                .to_string(),
        ],
        Category::Main => vec![
            "Neo Games é um servidor de Cabal Online. Notícias, rankings, loja e downloads \
             estão disponíveis no site oficial."
                .to_string(),
        ],
        _ => Vec::new(),
    };

    let now = Utc::now();
    texts
        .into_iter()
        .map(|content| {
            let mut extra = BTreeMap::new();
            extra.insert(
                "timestamp_source".to_string(),
                TimestampSource::Acquisition.as_str().to_string(),
            );
            extra.insert("source".to_string(), "default".to_string());
            Document {
                content,
                category,
                origin_url: format!("{}{}", DEFAULT_ORIGIN_PREFIX, category.key()),
                acquired_at: now,
                extra,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_defaults_mention_every_class() {
        let docs = default_documents(Category::System);
        assert_eq!(docs.len(), 2);
        for class in CharacterClass::ALL {
            assert!(docs[0].content.contains(class.name_en()));
        }
        assert_eq!(docs[0].extra["source"], "default");
        assert!(docs[0].origin_url.starts_with(DEFAULT_ORIGIN_PREFIX));
    }

    #[test]
    fn test_no_defaults_for_time_sensitive_or_rankings() {
        assert!(default_documents(Category::News).is_empty());
        for category in Category::rankings() {
            assert!(default_documents(category).is_empty());
        }
    }
}
