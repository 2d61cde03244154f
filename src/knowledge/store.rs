//! Document Archive - rusqlite 기반 문서 보관소
//!
//! 카테고리별 마지막 성공 수집 결과와 수동 등록 위치를 보관합니다.
//! 재시작 후 수집이 실패한 카테고리의 콘텐츠를 복원하는 데 사용됩니다.
//! 저장 위치: <data_dir>/archive.db

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

use super::category::Category;
use super::normalizer::Document;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (<data_local_dir>/.neo-knowledge/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".neo-knowledge")
}

// ============================================================================
// Types
// ============================================================================

/// 수동 등록 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualLocation {
    pub category: Category,
    pub url: String,
    pub added_at: DateTime<Utc>,
}

/// 보관소 통계
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub document_count: usize,
    pub total_content_bytes: usize,
    pub per_category: BTreeMap<String, usize>,
    pub db_path: PathBuf,
}

// ============================================================================
// DocumentArchive
// ============================================================================

/// 문서 보관소
pub struct DocumentArchive {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl DocumentArchive {
    /// 보관소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let archive = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        archive.initialize()?;
        Ok(archive)
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                origin_url TEXT NOT NULL,
                content TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                extra TEXT NOT NULL DEFAULT '{}',
                archived_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_category ON documents(category, ordinal);

            CREATE TABLE IF NOT EXISTS manual_locations (
                category TEXT NOT NULL,
                url TEXT NOT NULL,
                added_at TEXT NOT NULL,
                PRIMARY KEY (category, url)
            );
            "#,
        )
        .context("Failed to create archive schema")?;

        tracing::debug!("Document archive initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 카테고리 문서 전체 교체 (트랜잭션)
    pub fn replace_category(&self, category: Category, documents: &[Document]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let key = category.key();
        let now = Utc::now().to_rfc3339();

        tx.execute("DELETE FROM documents WHERE category = ?1", params![key])
            .context("Failed to clear category")?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (category, ordinal, origin_url, content, acquired_at, extra, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (ordinal, doc) in documents.iter().enumerate() {
                let extra = serde_json::to_string(&doc.extra).context("Failed to encode extra")?;
                stmt.execute(params![
                    key,
                    ordinal as i64,
                    doc.origin_url,
                    doc.content,
                    doc.acquired_at.to_rfc3339(),
                    extra,
                    now
                ])
                .context("Failed to insert document")?;
            }
        }

        tx.commit().context("Failed to commit category")?;
        tracing::debug!("Archived {} documents for {}", documents.len(), category);
        Ok(documents.len())
    }

    /// 카테고리 문서 조회 (수집 순서)
    pub fn documents_for(&self, category: Category) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT origin_url, content, acquired_at, extra FROM documents
             WHERE category = ?1
             ORDER BY ordinal",
        )?;

        let docs = stmt
            .query_map(params![category.key()], |row| {
                Ok(Document {
                    content: row.get(1)?,
                    category,
                    origin_url: row.get(0)?,
                    acquired_at: parse_datetime(row.get::<_, String>(2)?),
                    extra: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(docs)
    }

    /// 문서 목록 (최근 수집 순)
    pub fn list_documents(&self, limit: usize, category: Option<Category>) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT category, origin_url, content, acquired_at, extra FROM documents
             WHERE ?1 IS NULL OR category = ?1
             ORDER BY acquired_at DESC, id
             LIMIT ?2",
        )?;

        let docs = stmt
            .query_map(params![category.map(|c| c.key()), limit as i64], |row| {
                let key: String = row.get(0)?;
                Ok((key, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?, row.get::<_, String>(4)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(key, origin_url, content, acquired_at, extra)| {
                let category = key.parse().ok()?;
                Some(Document {
                    content,
                    category,
                    origin_url,
                    acquired_at: parse_datetime(acquired_at),
                    extra: serde_json::from_str(&extra).unwrap_or_default(),
                })
            })
            .collect();

        Ok(docs)
    }

    // ========================================================================
    // Manual Locations
    // ========================================================================

    /// 수동 위치 등록 (이미 있으면 false)
    pub fn add_location(&self, category: Category, url: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO manual_locations (category, url, added_at) VALUES (?1, ?2, ?3)",
                params![category.key(), url, Utc::now().to_rfc3339()],
            )
            .context("Failed to insert manual location")?;
        Ok(changed > 0)
    }

    /// 수동 위치 삭제 (없으면 false)
    pub fn remove_location(&self, category: Category, url: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM manual_locations WHERE category = ?1 AND url = ?2",
                params![category.key(), url],
            )
            .context("Failed to delete manual location")?;
        Ok(changed > 0)
    }

    /// 등록된 수동 위치 (등록 순)
    pub fn locations(&self) -> Result<Vec<ManualLocation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT category, url, added_at FROM manual_locations ORDER BY added_at, rowid",
        )?;

        let locations = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(key, url, added_at)| {
                let category = match key.parse() {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("Skipping manual location with bad category: {}", e);
                        return None;
                    }
                };
                Some(ManualLocation {
                    category,
                    url,
                    added_at: parse_datetime(added_at),
                })
            })
            .collect();

        Ok(locations)
    }

    /// 보관소 통계
    pub fn stats(&self) -> Result<ArchiveStats> {
        let conn = self.lock()?;

        let (count, total_size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0) FROM documents",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));

        let mut stmt = conn.prepare("SELECT category, COUNT(*) FROM documents GROUP BY category")?;
        let per_category = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(ArchiveStats {
            document_count: count as usize,
            total_content_bytes: total_size as usize,
            per_category,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_archive() -> (TempDir, DocumentArchive) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("archive.db");
        let archive = DocumentArchive::open(&db_path).unwrap();
        (dir, archive)
    }

    fn doc(category: Category, origin: &str, content: &str) -> Document {
        let mut extra = BTreeMap::new();
        extra.insert("timestamp_source".to_string(), "content".to_string());
        Document {
            content: content.to_string(),
            category,
            origin_url: origin.to_string(),
            acquired_at: DateTime::parse_from_rfc3339("2025-05-10T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            extra,
        }
    }

    #[test]
    fn test_replace_and_read_category() {
        let (_dir, archive) = create_test_archive();

        archive
            .replace_category(
                Category::News,
                &[doc(Category::News, "n1", "first"), doc(Category::News, "n2", "second")],
            )
            .unwrap();
        archive
            .replace_category(Category::Faq, &[doc(Category::Faq, "f", "faq")])
            .unwrap();

        let news = archive.documents_for(Category::News).unwrap();
        assert_eq!(news.len(), 2);
        assert_eq!(news[0], doc(Category::News, "n1", "first"));

        // 교체 시 이전 문서는 사라짐
        archive
            .replace_category(Category::News, &[doc(Category::News, "n3", "third")])
            .unwrap();
        let news = archive.documents_for(Category::News).unwrap();
        assert_eq!(news.len(), 1);
        assert_eq!(news[0].content, "third");
        assert_eq!(archive.documents_for(Category::Faq).unwrap().len(), 1);
    }

    #[test]
    fn test_list_documents_filter() {
        let (_dir, archive) = create_test_archive();
        archive
            .replace_category(Category::Shop, &[doc(Category::Shop, "s", "potion")])
            .unwrap();
        archive
            .replace_category(Category::Vip, &[doc(Category::Vip, "v", "perks")])
            .unwrap();

        assert_eq!(archive.list_documents(10, None).unwrap().len(), 2);
        let vip = archive.list_documents(10, Some(Category::Vip)).unwrap();
        assert_eq!(vip.len(), 1);
        assert_eq!(vip[0].category, Category::Vip);
    }

    #[test]
    fn test_manual_locations() {
        let (_dir, archive) = create_test_archive();
        let url = "https://www.neogames.online/news/event";

        assert!(archive.add_location(Category::News, url).unwrap());
        assert!(!archive.add_location(Category::News, url).unwrap());
        assert!(archive.add_location(Category::Shop, url).unwrap());

        let locations = archive.locations().unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].category, Category::News);

        assert!(archive.remove_location(Category::News, url).unwrap());
        assert!(!archive.remove_location(Category::News, url).unwrap());
        assert_eq!(archive.locations().unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let (_dir, archive) = create_test_archive();
        archive
            .replace_category(Category::Faq, &[doc(Category::Faq, "f", "1234567890")])
            .unwrap();

        let stats = archive.stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.total_content_bytes, 10);
        assert_eq!(stats.per_category["faq"], 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("archive.db");
        {
            let archive = DocumentArchive::open(&db_path).unwrap();
            archive
                .replace_category(Category::System, &[doc(Category::System, "s", "crafting")])
                .unwrap();
        }
        let archive = DocumentArchive::open(&db_path).unwrap();
        assert_eq!(archive.documents_for(Category::System).unwrap().len(), 1);
    }
}
