//! Lexical Index - BM25 sparse 검색
//!
//! 대소문자를 접은 공백 토큰으로 색인합니다. 토큰 양끝의 문장부호는
//! 제거합니다 ("maintenance?" == "maintenance").

use std::collections::HashMap;

use super::snapshot::ChunkId;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// 색인/질의 공통 토크나이저
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// BM25 인덱스
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    ids: Vec<ChunkId>,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<u32>,
    doc_freqs: HashMap<String, u32>,
    avg_doc_len: f32,
}

impl LexicalIndex {
    /// 엔트리 순서대로 인덱스 구성
    pub fn build<'a>(rows: impl IntoIterator<Item = (ChunkId, &'a str)>) -> Self {
        let mut index = Self::default();
        let mut total_len: u64 = 0;

        for (id, text) in rows {
            let tokens = tokenize(text);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens.iter() {
                *tf.entry(token.clone()).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *index.doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }

            total_len += tokens.len() as u64;
            index.ids.push(id);
            index.doc_lens.push(tokens.len() as u32);
            index.term_freqs.push(tf);
        }

        if !index.ids.is_empty() {
            index.avg_doc_len = total_len as f32 / index.ids.len() as f32;
        }
        index
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ChunkId] {
        &self.ids
    }

    /// BM25 점수 > 0 인 상위 `limit`개 (position, score)
    pub fn search(&self, query: &str, limit: usize, accept: impl Fn(usize) -> bool) -> Vec<(usize, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut results: Vec<(usize, f32)> = (0..self.ids.len())
            .filter(|&pos| accept(pos))
            .map(|pos| (pos, self.score(pos, &terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        results
    }

    fn score(&self, pos: usize, terms: &[String]) -> f32 {
        let n = self.ids.len() as f32;
        let doc_len = self.doc_lens[pos] as f32;
        let tf = &self.term_freqs[pos];

        terms
            .iter()
            .filter_map(|term| {
                let freq = *tf.get(term)? as f32;
                let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f32;
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                let norm = K1 * (1.0 - B + B * doc_len / self.avg_doc_len.max(1e-3));
                Some(idf * freq * (K1 + 1.0) / (freq + norm))
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ChunkId {
        ChunkId::from_hex(format!("{:064x}", n))
    }

    fn index() -> LexicalIndex {
        LexicalIndex::build(vec![
            (id(1), "Server maintenance on Tuesday."),
            (id(2), "The shop sells potions and armor."),
            (id(3), "Maintenance maintenance maintenance extended."),
        ])
    }

    #[test]
    fn test_tokenize_case_folds_and_trims_punctuation() {
        assert_eq!(
            tokenize("  Server MAINTENANCE, today?! (x) "),
            vec!["server", "maintenance", "today", "x"]
        );
        assert!(tokenize(" ... ").is_empty());
    }

    #[test]
    fn test_search_ranks_term_frequency() {
        let results = index().search("maintenance", 10, |_| true);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 0);
    }

    #[test]
    fn test_search_only_positive_scores() {
        assert!(index().search("dragon", 10, |_| true).is_empty());
        assert!(index().search("", 10, |_| true).is_empty());
    }

    #[test]
    fn test_search_respects_filter() {
        let results = index().search("maintenance shop", 10, |pos| pos == 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_single_document_still_scores() {
        let index = LexicalIndex::build(vec![(id(9), "Shop is closed.")]);
        let results = index.search("shop", 5, |_| true);
        assert_eq!(results.len(), 1);
        assert!(results[0].1 > 0.0);
    }
}
