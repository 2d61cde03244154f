//! Document Normalizer - 원시 콘텐츠를 정규 Document로 변환
//!
//! HTML 보일러플레이트 제거, 공백 정규화, 콘텐츠 타임스탬프 추출을 담당합니다.
//! 순수 함수로만 구성되며 I/O가 없습니다.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::category::{Category, RankingPartition};
use super::rankings::{self, RankingRow};

// ============================================================================
// Types
// ============================================================================

/// 원시 콘텐츠 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    Html,
    Text,
}

/// 수집기가 전달하는 원시 콘텐츠
#[derive(Debug, Clone)]
pub struct RawContent {
    pub body: String,
    pub format: ContentFormat,
    /// 원본 URL 또는 파일 경로
    pub origin: String,
    /// 수집 시각
    pub acquired_at: DateTime<Utc>,
}

impl RawContent {
    pub fn html(body: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            format: ContentFormat::Html,
            origin: origin.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn text(body: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            format: ContentFormat::Text,
            origin: origin.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn acquired(mut self, at: DateTime<Utc>) -> Self {
        self.acquired_at = at;
        self
    }
}

/// 정규화된 문서 (불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub category: Category,
    pub origin_url: String,
    /// 최선의 콘텐츠 타임스탬프
    pub acquired_at: DateTime<Utc>,
    pub extra: BTreeMap<String, String>,
}

/// 타임스탬프 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    Content,
    Origin,
    Acquisition,
}

impl TimestampSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampSource::Content => "content",
            TimestampSource::Origin => "origin",
            TimestampSource::Acquisition => "acquisition",
        }
    }
}

// ============================================================================
// Normalize
// ============================================================================

const EXCLUDED_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "header", "iframe", "svg", "form",
];
const EXCLUDED_CLASSES: &[&str] = &["ads", "modal"];
const MAIN_CONTAINERS: &[&str] = &[
    "main",
    "[role=main]",
    "article",
    ".content",
    ".main-content",
    "body",
];
const PARAGRAPH_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "aside", "h1", "h2", "h3", "h4", "h5", "h6",
    "ul", "ol", "table", "blockquote", "pre", "dl",
];
const LINE_TAGS: &[&str] = &["br", "li", "tr", "dt", "dd"];

/// 원시 콘텐츠를 Document 목록으로 변환
///
/// 정리 후 텍스트가 비면 빈 목록을 반환합니다 (에러 아님).
pub fn normalize(raw: &RawContent, category: Category) -> Vec<Document> {
    match (raw.format, category) {
        (ContentFormat::Html, Category::Ranking(partition)) => normalize_ranking(raw, category, partition),
        (ContentFormat::Html, Category::News) => {
            let html = Html::parse_document(&raw.body);
            let articles = article_texts(&html);
            if articles.len() > 1 {
                articles
                    .into_iter()
                    .filter_map(|text| build_document(text, raw, category))
                    .collect()
            } else {
                build_document(clean_html(&html), raw, category).into_iter().collect()
            }
        }
        (ContentFormat::Html, _) => {
            let html = Html::parse_document(&raw.body);
            build_document(clean_html(&html), raw, category).into_iter().collect()
        }
        (ContentFormat::Text, _) => build_document(raw.body.clone(), raw, category)
            .into_iter()
            .collect(),
    }
}

fn build_document(text: String, raw: &RawContent, category: Category) -> Option<Document> {
    let content = normalize_whitespace(&text);
    if content.is_empty() {
        return None;
    }

    let (acquired_at, source) = resolve_timestamp(&content, &raw.origin, raw.acquired_at);
    let mut extra = BTreeMap::new();
    extra.insert("timestamp_source".to_string(), source.as_str().to_string());

    Some(Document {
        content,
        category,
        origin_url: raw.origin.clone(),
        acquired_at,
        extra,
    })
}

fn normalize_ranking(raw: &RawContent, category: Category, partition: RankingPartition) -> Vec<Document> {
    let parsed = match partition {
        RankingPartition::Power(_) => rankings::parse_power_ranking(&raw.body)
            .map(|rows| rows.into_iter().map(RankingRow::Power).collect::<Vec<_>>()),
        RankingPartition::Guild => rankings::parse_guild_ranking(&raw.body)
            .map(|rows| rows.into_iter().map(RankingRow::Guild).collect()),
        RankingPartition::Memorial => rankings::parse_memorial_ranking(&raw.body)
            .map(|rows| rows.into_iter().map(RankingRow::Memorial).collect()),
    };

    let rows = match parsed {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("Ranking parse failed for {}: {:#}", category, e);
            return Vec::new();
        }
    };

    rows.into_iter()
        .map(|row| {
            let mut extra = BTreeMap::new();
            extra.insert(
                "timestamp_source".to_string(),
                TimestampSource::Acquisition.as_str().to_string(),
            );
            extra.insert("ranking_type".to_string(), row.ranking_type().to_string());
            extra.insert("position".to_string(), row.position().to_string());
            if let Some(class) = row.class() {
                extra.insert("class".to_string(), class.abbr().to_string());
            }

            Document {
                content: row.render(),
                category,
                origin_url: raw.origin.clone(),
                acquired_at: raw.acquired_at,
                extra,
            }
        })
        .collect()
}

// ============================================================================
// HTML Cleaning
// ============================================================================

/// 메인 컨테이너를 골라 블록 단위로 텍스트 추출
fn clean_html(html: &Html) -> String {
    for css in MAIN_CONTAINERS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        if let Some(element) = html.select(&selector).find(|el| !is_excluded(el)) {
            let mut out = String::new();
            collect_text(element, &mut out);
            if !out.trim().is_empty() {
                return out;
            }
        }
    }

    // body가 없는 조각 HTML
    let mut out = String::new();
    collect_text(html.root_element(), &mut out);
    out
}

/// 뉴스 페이지의 개별 기사 텍스트
fn article_texts(html: &Html) -> Vec<String> {
    let Ok(selector) = Selector::parse("article") else {
        return Vec::new();
    };
    html.select(&selector)
        .filter(|el| !is_excluded(el))
        .map(|el| {
            let mut out = String::new();
            collect_text(el, &mut out);
            out
        })
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn is_excluded(element: &ElementRef) -> bool {
    let el = element.value();
    EXCLUDED_TAGS.contains(&el.name()) || el.classes().any(|c| EXCLUDED_CLASSES.contains(&c))
}

fn collect_text(element: ElementRef, out: &mut String) {
    let name = element.value().name();
    let paragraph = PARAGRAPH_TAGS.contains(&name);
    let line = LINE_TAGS.contains(&name);

    if paragraph {
        out.push_str("\n\n");
    } else if line {
        out.push('\n');
    }

    for child in element.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if !is_excluded(&child_el) {
                collect_text(child_el, out);
            }
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }

    if paragraph {
        out.push_str("\n\n");
    } else if matches!(name, "td" | "th") {
        out.push(' ');
    }
}

// ============================================================================
// Whitespace
// ============================================================================

/// 공백 정규화
///
/// 공백/탭 연속은 한 칸, 각 줄 trim, 빈 줄 연속은 문단 구분 하나로.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_pending = false;

    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_pending = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_pending { "\n\n" } else { "\n" });
        }
        out.push_str(&collapsed);
        blank_pending = false;
    }

    out
}

// ============================================================================
// Timestamp Extraction
// ============================================================================

#[derive(Clone, Copy)]
enum DateShape {
    IsoDateTime,
    IsoDate,
    DayMonthYear,
    PortugueseLong,
    EnglishLong,
}

fn content_patterns() -> &'static [(DateShape, Regex)] {
    static PATTERNS: OnceLock<Vec<(DateShape, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                DateShape::IsoDateTime,
                r"\b(\d{4})-(\d{2})-(\d{2})[ T](\d{2}):(\d{2})(?::(\d{2}))?",
            ),
            (DateShape::IsoDate, r"\b(\d{4})-(\d{2})-(\d{2})\b"),
            (DateShape::DayMonthYear, r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b"),
            (DateShape::DayMonthYear, r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b"),
            (
                DateShape::PortugueseLong,
                r"(?i)\b(\d{1,2}) de (janeiro|fevereiro|março|marco|abril|maio|junho|julho|agosto|setembro|outubro|novembro|dezembro) de (\d{4})\b",
            ),
            (
                DateShape::EnglishLong,
                r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december) (\d{1,2}),? (\d{4})\b",
            ),
        ]
        .into_iter()
        .filter_map(|(shape, pattern)| Regex::new(pattern).ok().map(|re| (shape, re)))
        .collect()
    })
}

fn origin_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"/(\d{4})/(\d{2})/(\d{2})(?:/|$)",
            r"(\d{4})-(\d{2})-(\d{2})",
            r"(?:^|\D)(\d{4})(\d{2})(\d{2})(?:\D|$)",
        ]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// 콘텐츠 → 원본 경로 → 수집 시각 순서로 타임스탬프 결정
pub fn resolve_timestamp(
    content: &str,
    origin: &str,
    acquired_at: DateTime<Utc>,
) -> (DateTime<Utc>, TimestampSource) {
    if let Some(ts) = extract_content_timestamp(content) {
        return (ts, TimestampSource::Content);
    }
    if let Some(ts) = extract_origin_timestamp(origin) {
        return (ts, TimestampSource::Origin);
    }
    (acquired_at, TimestampSource::Acquisition)
}

/// 텍스트 안의 첫 번째 유효한 날짜 (패턴 우선순위 순)
pub fn extract_content_timestamp(text: &str) -> Option<DateTime<Utc>> {
    content_patterns().iter().find_map(|(shape, re)| {
        re.captures_iter(text)
            .find_map(|caps| captures_to_datetime(*shape, &caps))
    })
}

fn extract_origin_timestamp(origin: &str) -> Option<DateTime<Utc>> {
    origin_patterns().iter().find_map(|re| {
        re.captures_iter(origin).find_map(|caps| {
            let date = ymd(&caps[1], &caps[2], &caps[3])?;
            Some(at_midnight(date))
        })
    })
}

fn captures_to_datetime(shape: DateShape, caps: &Captures) -> Option<DateTime<Utc>> {
    match shape {
        DateShape::IsoDateTime => {
            let date = ymd(&caps[1], &caps[2], &caps[3])?;
            let seconds = caps.get(6).map_or(Some(0), |m| m.as_str().parse().ok())?;
            let time = NaiveTime::from_hms_opt(caps[4].parse().ok()?, caps[5].parse().ok()?, seconds)?;
            Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
        }
        DateShape::IsoDate => ymd(&caps[1], &caps[2], &caps[3]).map(at_midnight),
        DateShape::DayMonthYear => ymd(&caps[3], &caps[2], &caps[1]).map(at_midnight),
        DateShape::PortugueseLong => {
            let month = portuguese_month(&caps[2])?;
            ymd(&caps[3], &month.to_string(), &caps[1]).map(at_midnight)
        }
        DateShape::EnglishLong => {
            let month = english_month(&caps[1])?;
            ymd(&caps[3], &month.to_string(), &caps[2]).map(at_midnight)
        }
    }
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn at_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::MIN))
}

fn portuguese_month(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().as_str() {
        "janeiro" => 1,
        "fevereiro" => 2,
        "março" | "marco" => 3,
        "abril" => 4,
        "maio" => 5,
        "junho" => 6,
        "julho" => 7,
        "agosto" => 8,
        "setembro" => 9,
        "outubro" => 10,
        "novembro" => 11,
        "dezembro" => 12,
        _ => return None,
    };
    Some(month)
}

fn english_month(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().as_str() {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => return None,
    };
    Some(month)
}

// ============================================================================
// Tests
// ============================================================================
