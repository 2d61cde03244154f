//! 수집 모듈 - 카테고리 위치에서 원본 콘텐츠 가져오기
//!
//! HTML 정제는 normalizer가 담당하고, 이 모듈은 가져오기와
//! 사이트맵 탐색만 합니다.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

use crate::knowledge::{Category, RawContent};

const USER_AGENT: &str = "neo-knowledge/0.1";

// ============================================================================
// Acquirer Trait
// ============================================================================

/// 원본 콘텐츠 수집기
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// 카테고리 위치들에서 콘텐츠 수집
    ///
    /// 일부 위치만 성공해도 Ok. 전부 실패하면 에러.
    async fn acquire(&self, category: Category, locations: &[String]) -> Result<Vec<RawContent>>;

    /// 사이트맵 엔트리 탐색 (지원하지 않으면 빈 목록)
    async fn discover(&self, _sitemap_url: &str) -> Result<Vec<SitemapEntry>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// HttpAcquirer
// ============================================================================

/// reqwest 기반 HTTP 수집기
pub struct HttpAcquirer {
    client: reqwest::Client,
}

impl HttpAcquirer {
    /// 새 수집기 생성 (요청 1회당 타임아웃)
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<RawContent> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request failed: {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad status: {}", url))?;

        let is_plain = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/plain"))
            .unwrap_or(false);

        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read body: {}", url))?;

        let raw = if is_plain {
            RawContent::text(body, url)
        } else {
            RawContent::html(body, url)
        };
        Ok(raw.acquired(Utc::now()))
    }
}

#[async_trait]
impl Acquirer for HttpAcquirer {
    async fn acquire(&self, category: Category, locations: &[String]) -> Result<Vec<RawContent>> {
        if locations.is_empty() {
            anyhow::bail!("No locations configured for {}", category);
        }

        let mut contents = Vec::with_capacity(locations.len());
        let mut failures = Vec::new();

        for url in locations {
            tracing::debug!("Fetching {} for {}", url, category);
            match self.fetch(url).await {
                Ok(raw) => contents.push(raw),
                Err(e) => {
                    tracing::warn!("Failed to fetch {}: {:#}", url, e);
                    failures.push(format!("{:#}", e));
                }
            }
        }

        if contents.is_empty() {
            anyhow::bail!("All {} locations failed: {}", locations.len(), failures.join("; "));
        }
        Ok(contents)
    }

    async fn discover(&self, sitemap_url: &str) -> Result<Vec<SitemapEntry>> {
        let body = self
            .client
            .get(sitemap_url)
            .send()
            .await
            .context("Sitemap request failed")?
            .error_for_status()
            .context("Sitemap returned error status")?
            .text()
            .await
            .context("Failed to read sitemap")?;

        let entries = parse_sitemap(&body);
        tracing::info!("Sitemap discovery found {} entries", entries.len());
        Ok(entries)
    }
}

// ============================================================================
// Sitemap
// ============================================================================

/// 사이트맵 엔트리
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapEntry {
    pub url: String,
    pub lastmod: Option<DateTime<Utc>>,
    pub priority: f32,
}

/// `<url>` 블록 안에서 읽는 중인 필드
#[derive(Debug, Clone, Copy)]
enum SitemapField {
    Loc,
    Lastmod,
    Priority,
}

#[derive(Debug, Default)]
struct UrlFields {
    loc: String,
    lastmod: String,
    priority: String,
}

impl UrlFields {
    fn push(&mut self, field: SitemapField, text: &str) {
        match field {
            SitemapField::Loc => self.loc.push_str(text),
            SitemapField::Lastmod => self.lastmod.push_str(text),
            SitemapField::Priority => self.priority.push_str(text),
        }
    }

    fn into_entry(self) -> Option<SitemapEntry> {
        let url = self.loc.trim();
        if url.is_empty() {
            return None;
        }
        Some(SitemapEntry {
            url: url.to_string(),
            lastmod: parse_lastmod(self.lastmod.trim()),
            priority: self.priority.trim().parse::<f32>().unwrap_or(0.5),
        })
    }
}

/// sitemap.xml 파싱 (`<url>` 블록마다 loc/lastmod/priority)
///
/// 태그는 네임스페이스 접두사를 무시하고 로컬 이름으로 비교합니다.
/// `<url>`의 직계 자식만 읽으므로 `<image:loc>` 같은 확장 태그는 무시됩니다.
/// 형식이 깨진 지점 이후는 버리고, 그 전까지 읽은 엔트리를 돌려줍니다.
pub fn parse_sitemap(xml: &str) -> Vec<SitemapEntry> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<UrlFields> = None;
    let mut field: Option<SitemapField> = None;
    // <url> 아래 깊이
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if current.is_none() {
                    if e.local_name().as_ref() == b"url" {
                        current = Some(UrlFields::default());
                        depth = 0;
                    }
                    continue;
                }
                depth += 1;
                field = match (depth, e.local_name().as_ref()) {
                    (1, b"loc") => Some(SitemapField::Loc),
                    (1, b"lastmod") => Some(SitemapField::Lastmod),
                    (1, b"priority") => Some(SitemapField::Priority),
                    _ => None,
                };
            }
            Ok(Event::End(_)) if current.is_some() => {
                if depth == 0 {
                    if let Some(entry) = current.take().and_then(UrlFields::into_entry) {
                        entries.push(entry);
                    }
                } else {
                    depth -= 1;
                }
                field = None;
            }
            Ok(Event::Text(text)) => {
                if let (Some(fields), Some(f)) = (current.as_mut(), field) {
                    match text.unescape() {
                        Ok(value) => fields.push(f, &value),
                        Err(e) => tracing::debug!("Skipping undecodable sitemap text: {}", e),
                    }
                }
            }
            Ok(Event::CData(data)) => {
                if let (Some(fields), Some(f)) = (current.as_mut(), field) {
                    fields.push(f, &String::from_utf8_lossy(&data));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(
                    "Malformed sitemap at byte {}: {}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
    }

    entries
}

fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// 사이트맵 엔트리를 첫 경로 세그먼트로 카테고리에 배정
///
/// 기준 호스트가 아닌 URL과 알 수 없는 섹션은 버립니다. 순서 유지, 중복 제거.
pub fn group_by_category(entries: &[SitemapEntry], base_url: &str) -> BTreeMap<Category, Vec<String>> {
    let base_host = Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    let mut grouped: BTreeMap<Category, Vec<String>> = BTreeMap::new();
    let mut seen = HashSet::new();

    for entry in entries {
        let Ok(url) = Url::parse(&entry.url) else {
            continue;
        };
        if url.host_str().map(str::to_string) != base_host {
            continue;
        }
        let Some(category) = Category::from_site_path(url.path()) else {
            continue;
        };
        let normalized = url.to_string();
        if seen.insert(normalized.clone()) {
            grouped.entry(category).or_default().push(normalized);
        }
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITEMAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
            <url>
                <loc>https://www.neogames.online/</loc>
                <priority>1.0</priority>
            </url>
            <url>
                <loc>https://www.neogames.online/news/patch-notes</loc>
                <lastmod>2025-05-10</lastmod>
                <priority>0.8</priority>
            </url>
            <url>
                <loc>https://www.neogames.online/news/event?id=1&amp;lang=pt</loc>
                <lastmod>2025-05-11T10:00:00+00:00</lastmod>
            </url>
            <url><loc>https://www.neogames.online/forum/thread</loc></url>
            <url><loc>https://elsewhere.example/news/x</loc></url>
            <url><loc>https://www.neogames.online/news/patch-notes</loc></url>
        </urlset>"#;

    #[test]
    fn test_acquirer_creation() {
        assert!(HttpAcquirer::new(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_parse_sitemap() {
        let entries = parse_sitemap(SITEMAP);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].priority, 1.0);
        assert_eq!(entries[1].priority, 0.8);
        assert_eq!(
            entries[1].lastmod.map(|d| d.format("%Y-%m-%d").to_string()),
            Some("2025-05-10".to_string())
        );
        assert_eq!(entries[2].url, "https://www.neogames.online/news/event?id=1&lang=pt");
        assert!(entries[2].lastmod.is_some());
        assert_eq!(entries[3].priority, 0.5);
        assert!(entries[3].lastmod.is_none());
    }

    #[test]
    fn test_group_by_category() {
        let entries = parse_sitemap(SITEMAP);
        let grouped = group_by_category(&entries, "https://www.neogames.online");

        assert_eq!(grouped[&Category::Main], vec!["https://www.neogames.online/".to_string()]);
        assert_eq!(grouped[&Category::News].len(), 2);
        assert_eq!(grouped.len(), 2);
    }

    #[test]
    fn test_parse_sitemap_xml_forms() {
        let xml = r#"<?xml version="1.0"?>
            <sm:urlset xmlns:sm="http://www.sitemaps.org/schemas/sitemap/0.9"
                       xmlns:image="http://www.google.com/schemas/sitemap-image/1.1">
                <sm:url>
                    <sm:loc><![CDATA[https://www.neogames.online/news/a]]></sm:loc>
                    <image:image>
                        <image:loc>https://cdn.neogames.online/banner.png</image:loc>
                    </image:image>
                </sm:url>
                <sm:url id="c"><sm:loc>https://www.neogames.online/faq</sm:loc></sm:url>
                <sm:url><sm:loc>https://www.neogames.online/shop?x=1&apos;y&amp;z=&quot;2&quot;</sm:loc></sm:url>
                <sm:url><sm:priority>0.3</sm:priority></sm:url>
            </sm:urlset>"#;

        let entries = parse_sitemap(xml);
        let urls: Vec<&str> = entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.neogames.online/news/a",
                "https://www.neogames.online/faq",
                "https://www.neogames.online/shop?x=1'y&z=\"2\"",
            ]
        );
    }

    #[test]
    fn test_parse_sitemap_keeps_entries_before_error() {
        let xml = "<urlset><url><loc>https://www.neogames.online/vip</loc></url><url><loc>x</lastmod></url>";
        let entries = parse_sitemap(xml);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://www.neogames.online/vip");
    }

    #[test]
    fn test_parse_sitemap_garbage() {
        assert!(parse_sitemap("not xml at all").is_empty());
    }

    #[tokio::test]
    async fn test_acquire_without_locations_fails() {
        let acquirer = HttpAcquirer::new(Duration::from_secs(1)).expect("acquirer");
        assert!(acquirer.acquire(Category::Faq, &[]).await.is_err());
    }
}
