//! Read-mostly access to the document index.
//!
//! Every operation opens its own connection, runs, and closes it; no handle
//! outlives the call. Lock contention is retried with a bounded backoff, and
//! reads against optional tables the admin layer never provisioned return
//! empty results instead of failing.
//!
//! Text matching (`*_like`) is case- and accent-insensitive: SQLite's `LIKE`
//! prefilters with an accent-tolerant pattern under a row cap, and every row
//! is folded and checked in Rust. Exact matches are scanned first.

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection, Row, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::AssistantError;
use crate::models::{
    basename, extension, normalize_path, parent_dir, ChunkVector, ConceptSource, ConceptSummary,
    Evidence, MalformedCase, PathMatch, PinnedSource, QaRecord, SourceRef, TestCase, TestResult,
};
use crate::text;

const MAX_RETRIES: u32 = 4;
const BASE_BACKOFF_MS: u64 = 40;
const MAX_QA_SOURCES: usize = 5;

/// Rows scanned per lookup, as a multiple of the requested limit.
const SCAN_FACTOR: usize = 4;
/// Bound values per evidence query, below SQLite's default variable limit.
const MAX_BINDS: usize = 900;
/// Folded letters whose stored form may carry a diacritic.
const ACCENTABLE: &str = "aeiouycn";

pub struct Store {
    options: SqliteConnectOptions,
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            options: db::options(db_path)?,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Replace the lock wait of every connection this store opens.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.busy_timeout(timeout);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn conn(&self) -> Result<SqliteConnection, sqlx::Error> {
        db::connect(&self.options).await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_millis(BASE_BACKOFF_MS << attempt);
                    tracing::debug!(op, attempt, ?delay, "store busy, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_busy(&e) => {
                    return Err(AssistantError::StoreUnavailable(format!("{}: {}", op, e)).into())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run a read whose table may legitimately be absent.
    async fn read_optional<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        T: Default,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        match self.with_retry(op, f).await {
            Err(e) if is_missing_table_anyhow(&e) => {
                tracing::debug!(op, "optional table missing, returning empty");
                Ok(T::default())
            }
            other => other,
        }
    }

    async fn fetch(&self, op: &str, sql: &str, binds: &[&str]) -> Result<Vec<SqliteRow>> {
        self.read_optional(op, || async move {
            let mut conn = self.conn().await?;
            let rows = fetch_rows(&mut conn, sql, binds).await?;
            conn.close().await?;
            Ok(rows)
        })
        .await
    }

    // ============ Lexical reads ============

    /// Keywords for a document, case-insensitively distinct and sorted.
    pub async fn keywords_for(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.evidence_of(path).await?.keywords)
    }

    pub async fn note_for(&self, path: &str) -> Result<String> {
        Ok(self.evidence_of(path).await?.note)
    }

    async fn evidence_of(&self, path: &str) -> Result<Evidence> {
        let key = normalize_path(path);
        let mut spellings = BTreeSet::new();
        spellings.insert(path.to_string());
        let mut candidates = BTreeMap::new();
        candidates.insert(key.clone(), spellings);
        let mut found = self.evidence_for(&candidates).await?;
        Ok(found.remove(&key).unwrap_or_default())
    }

    /// Keywords and note for a batch of documents, keyed by normalized path.
    ///
    /// `candidates` maps each normalized path to the spellings it was seen
    /// under. A row belongs to a key when its stored path is one of those
    /// spellings or folds to the key; the batch shares one connection.
    pub async fn evidence_for(
        &self,
        candidates: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<HashMap<String, Evidence>> {
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }
        let batches = evidence_batches(candidates);
        let batches = batches.as_slice();

        let (keyword_rows, note_rows) = self
            .with_retry("evidence_for", || async move {
                let mut conn = self.conn().await?;
                let mut keywords: Vec<(String, String)> = Vec::new();
                let mut notes: Vec<(String, String)> = Vec::new();
                for batch in batches {
                    let binds: Vec<&str> = batch.binds.iter().map(String::as_str).collect();
                    for row in optional_rows(fetch_rows(&mut conn, &batch.keyword_sql, &binds).await)? {
                        keywords.push((row.get("fullpath"), row.get("keyword")));
                    }
                    for row in optional_rows(fetch_rows(&mut conn, &batch.note_sql, &binds).await)? {
                        notes.push((row.get("fullpath"), row.get("note")));
                    }
                }
                conn.close().await?;
                Ok((keywords, notes))
            })
            .await?;

        let mut out: HashMap<String, Evidence> = HashMap::new();
        for (fullpath, keyword) in keyword_rows {
            let key = normalize_path(&fullpath);
            if candidates.contains_key(&key) {
                out.entry(key).or_default().keywords.push(keyword);
            }
        }
        for (fullpath, note) in note_rows {
            let key = normalize_path(&fullpath);
            if candidates.contains_key(&key) {
                let evidence = out.entry(key).or_default();
                if evidence.note.is_empty() {
                    evidence.note = note;
                }
            }
        }
        for evidence in out.values_mut() {
            evidence.keywords = distinct_keywords(std::mem::take(&mut evidence.keywords));
        }
        Ok(out)
    }

    /// `(path, keyword)` pairs whose keyword contains `substring`.
    pub async fn keyword_like(&self, substring: &str, limit: usize) -> Result<Vec<(String, String)>> {
        Ok(self
            .keyword_matches(substring, limit)
            .await?
            .into_iter()
            .map(|m| (m.path, m.value))
            .collect())
    }

    /// `(path, note)` pairs whose note contains `substring`.
    pub async fn note_like(&self, substring: &str, limit: usize) -> Result<Vec<(String, String)>> {
        Ok(self
            .note_matches(substring, limit)
            .await?
            .into_iter()
            .map(|m| (m.path, m.value))
            .collect())
    }

    pub async fn keyword_matches(&self, substring: &str, limit: usize) -> Result<Vec<PathMatch>> {
        let sql = r#"
            SELECT fullpath, keyword AS value FROM doc_keywords
            WHERE keyword LIKE ?1 ESCAPE '\' OR keyword LIKE ?2 ESCAPE '\'
            ORDER BY (keyword LIKE ?1 ESCAPE '\') DESC, id
            LIMIT CAST(?3 AS INTEGER)
        "#;
        self.like_matches("keyword_like", sql, substring, limit).await
    }

    pub async fn note_matches(&self, substring: &str, limit: usize) -> Result<Vec<PathMatch>> {
        let sql = r#"
            SELECT fullpath, note AS value FROM doc_notes
            WHERE note LIKE ?1 ESCAPE '\' OR note LIKE ?2 ESCAPE '\'
            ORDER BY (note LIKE ?1 ESCAPE '\') DESC, fullpath
            LIMIT CAST(?3 AS INTEGER)
        "#;
        self.like_matches("note_like", sql, substring, limit).await
    }

    /// Binds `?1` exact pattern, `?2` accent-tolerant pattern, `?3` scan cap.
    async fn like_matches(
        &self,
        op: &str,
        sql: &str,
        substring: &str,
        limit: usize,
    ) -> Result<Vec<PathMatch>> {
        let exact = like_pattern(substring);
        let loose = loose_like_pattern(substring);
        let cap = scan_cap(limit);
        let rows = self
            .fetch(op, sql, &[exact.as_str(), loose.as_str(), cap.as_str()])
            .await?;
        Ok(filter_matches(&rows, substring, limit))
    }

    /// Paths whose basename or parent directory contains `substring`.
    ///
    /// Uses the `files` table when the scanner provisioned it, otherwise
    /// falls back to the paths known through keywords and notes.
    pub async fn name_or_dir_like(&self, substring: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .name_or_dir_matches(substring, limit)
            .await?
            .into_iter()
            .map(|m| m.path)
            .collect())
    }

    pub async fn name_or_dir_matches(&self, substring: &str, limit: usize) -> Result<Vec<PathMatch>> {
        let exact = like_pattern(substring);
        let loose = loose_like_pattern(substring);
        let cap = scan_cap(limit);
        let binds = [exact.as_str(), loose.as_str(), cap.as_str()];
        let binds = binds.as_slice();

        let files_result = self
            .with_retry("name_or_dir_like", || async move {
                let mut conn = self.conn().await?;
                let rows = fetch_rows(
                    &mut conn,
                    r#"
                    SELECT fullpath FROM files
                    WHERE name LIKE ?1 ESCAPE '\' OR dir LIKE ?1 ESCAPE '\'
                       OR name LIKE ?2 ESCAPE '\' OR dir LIKE ?2 ESCAPE '\'
                    ORDER BY (name LIKE ?1 ESCAPE '\' OR dir LIKE ?1 ESCAPE '\') DESC, fullpath
                    LIMIT CAST(?3 AS INTEGER)
                    "#,
                    binds,
                )
                .await?;
                conn.close().await?;
                Ok(rows)
            })
            .await;

        let rows = match files_result {
            Ok(rows) => rows,
            Err(e) if is_missing_table_anyhow(&e) => {
                tracing::debug!("files table missing, matching names through keywords and notes");
                self.fetch(
                    "name_or_dir_like",
                    r#"
                    SELECT fullpath FROM (
                        SELECT fullpath FROM doc_keywords
                        UNION
                        SELECT fullpath FROM doc_notes
                    )
                    WHERE fullpath LIKE ?1 ESCAPE '\' OR fullpath LIKE ?2 ESCAPE '\'
                    ORDER BY (fullpath LIKE ?1 ESCAPE '\') DESC, fullpath
                    LIMIT CAST(?3 AS INTEGER)
                    "#,
                    binds,
                )
                .await?
            }
            Err(e) => return Err(e),
        };

        let needle = text::fold(substring);
        let mut out: Vec<PathMatch> = Vec::new();
        for row in &rows {
            let fullpath: String = row.get("fullpath");
            let path = normalize_path(&fullpath);
            let hit = text::fold(basename(&path)).contains(&needle)
                || text::fold(parent_dir(&path)).contains(&needle);
            if hit && !out.iter().any(|m| m.path == path) {
                out.push(PathMatch {
                    path,
                    value: fullpath.clone(),
                    fullpath,
                });
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    // ============ Dense reads ============

    pub async fn chunks_and_vectors(&self) -> Result<Vec<ChunkVector>> {
        let rows = self
            .fetch(
                "chunks_and_vectors",
                r#"
                SELECT c.id, c.text, c.file_path, e.vec
                FROM chunks c
                JOIN embeddings e ON e.chunk_id = c.id
                ORDER BY c.id
                "#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vec");
                ChunkVector {
                    chunk_id: row.get("id"),
                    text: row.get("text"),
                    path: row.get("file_path"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    pub async fn rag_meta(&self, key: &str, default: &str) -> Result<String> {
        let rows = self
            .fetch(
                "rag_meta",
                "SELECT value FROM rag_meta WHERE key = ?1",
                &[key],
            )
            .await?;
        Ok(rows
            .first()
            .map(|r| r.get::<String, _>("value"))
            .unwrap_or_else(|| default.to_string()))
    }

    // ============ Pinned sources & concepts ============

    pub async fn pinned_sources(&self) -> Result<Vec<PinnedSource>> {
        let rows = self
            .fetch(
                "pinned_sources",
                "SELECT path, weight, COALESCE(note, '') AS note FROM pinned_sources ORDER BY weight DESC, path",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PinnedSource {
                path: normalize_path(&row.get::<String, _>("path")),
                weight: row.get("weight"),
                note: row.get("note"),
            })
            .collect())
    }

    /// Concepts whose slug, title or aliases relate to the query.
    pub async fn concepts_matching(&self, query: &str) -> Result<Vec<ConceptSummary>> {
        let folded_query = text::fold(query);
        let tokens = text::tokenize(query, &[]);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let concept_rows = self
            .fetch(
                "concepts_matching",
                "SELECT id, slug, title, body, tags FROM concepts ORDER BY id",
                &[],
            )
            .await?;
        if concept_rows.is_empty() {
            return Ok(Vec::new());
        }
        let alias_rows = self
            .fetch(
                "concepts_matching",
                "SELECT concept_id, alias FROM concept_alias ORDER BY alias",
                &[],
            )
            .await?;

        let mut out = Vec::new();
        for row in &concept_rows {
            let id: i64 = row.get("id");
            let slug: String = row.get("slug");
            let title: String = row.get("title");
            let aliases: Vec<String> = alias_rows
                .iter()
                .filter(|a| a.get::<i64, _>("concept_id") == id)
                .map(|a| a.get::<String, _>("alias"))
                .collect();

            let mut names = vec![text::fold(&slug.replace(['-', '_'], " ")), text::fold(&title)];
            names.extend(aliases.iter().map(|a| text::fold(a)));

            let matched = names.iter().any(|name| {
                (name.chars().count() >= text::MIN_TOKEN_LEN && folded_query.contains(name.as_str()))
                    || tokens.iter().any(|t| name.split(' ').any(|w| w == t))
            });
            if !matched {
                continue;
            }

            let tags: String = row.get("tags");
            out.push(ConceptSummary {
                sources: self.concept_sources(id).await?,
                slug,
                title,
                body: row.get("body"),
                tags: tags
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
                aliases,
            });
        }
        Ok(out)
    }

    async fn concept_sources(&self, concept_id: i64) -> Result<Vec<ConceptSource>> {
        let id = concept_id.to_string();
        let rows = self
            .fetch(
                "concept_sources",
                r#"
                SELECT path, weight, COALESCE(note, '') AS note FROM concept_sources
                WHERE concept_id = CAST(?1 AS INTEGER)
                ORDER BY position, path
                "#,
                &[id.as_str()],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ConceptSource {
                path: normalize_path(&row.get::<String, _>("path")),
                weight: row.get("weight"),
                note: row.get("note"),
            })
            .collect())
    }

    // ============ Q&A log ============

    /// Append a Q&A record with up to five source references.
    pub async fn append_qa(
        &self,
        query: &str,
        answer: &str,
        model: &str,
        sources: &[SourceRef],
    ) -> Result<i64> {
        let ts = chrono::Utc::now().to_rfc3339();
        let ts = ts.as_str();
        let sources = &sources[..sources.len().min(MAX_QA_SOURCES)];

        self.with_retry("append_qa", || async move {
            let mut conn = self.conn().await?;
            let mut tx = conn.begin().await?;
            let id = sqlx::query(
                "INSERT INTO qa_log (ts, query, answer, model) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(ts)
            .bind(query)
            .bind(answer)
            .bind(model)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for (rank, src) in sources.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO qa_sources (qa_id, rank, name, path, note, score) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(id)
                .bind(rank as i64 + 1)
                .bind(&src.name)
                .bind(&src.path)
                .bind(&src.note)
                .bind(src.score)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            conn.close().await?;
            Ok(id)
        })
        .await
    }

    pub async fn set_rating(&self, qa_id: i64, rating: i64, notes: &str) -> Result<()> {
        if !(0..=10).contains(&rating) {
            bail!("rating must be between 0 and 10, got {}", rating);
        }
        let now = chrono::Utc::now().to_rfc3339();
        let now = now.as_str();

        let updated = self
            .with_retry("set_rating", || async move {
                let mut conn = self.conn().await?;
                let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM qa_log WHERE id = ?1")
                    .bind(qa_id)
                    .fetch_one(&mut conn)
                    .await?;
                if exists == 0 {
                    conn.close().await?;
                    return Ok(false);
                }
                sqlx::query(
                    r#"
                    INSERT INTO qa_feedback (qa_id, rating, notes, updated_at) VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(qa_id) DO UPDATE SET
                        rating = excluded.rating,
                        notes = excluded.notes,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(qa_id)
                .bind(rating)
                .bind(notes)
                .bind(now)
                .execute(&mut conn)
                .await?;
                conn.close().await?;
                Ok(true)
            })
            .await?;

        if !updated {
            bail!("Q&A record not found: {}", qa_id);
        }
        Ok(())
    }

    /// Most recent records first; `filter` matches query or answer text.
    pub async fn list_qa(&self, filter: Option<&str>, limit: usize) -> Result<Vec<QaRecord>> {
        let pattern = like_pattern(filter.unwrap_or(""));
        let limit = limit.max(1).to_string();
        let rows = self
            .fetch(
                "list_qa",
                r#"
                SELECT q.id, q.ts, q.query, q.answer, q.model, f.rating, f.notes
                FROM qa_log q
                LEFT JOIN qa_feedback f ON f.qa_id = q.id
                WHERE q.query LIKE ?1 ESCAPE '\' OR q.answer LIKE ?1 ESCAPE '\'
                ORDER BY q.id DESC
                LIMIT CAST(?2 AS INTEGER)
                "#,
                &[pattern.as_str(), limit.as_str()],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| QaRecord {
                id: row.get("id"),
                ts: row.get("ts"),
                query: row.get("query"),
                answer: row.get("answer"),
                model: row.get("model"),
                rating: row.get("rating"),
                feedback: row.get("notes"),
            })
            .collect())
    }

    pub async fn qa_sources(&self, qa_id: i64) -> Result<Vec<SourceRef>> {
        let id = qa_id.to_string();
        let rows = self
            .fetch(
                "qa_sources",
                "SELECT name, path, note, score FROM qa_sources WHERE qa_id = CAST(?1 AS INTEGER) ORDER BY rank",
                &[id.as_str()],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| SourceRef {
                name: row.get("name"),
                path: row.get("path"),
                note: row.get("note"),
                score: row.get("score"),
            })
            .collect())
    }

    // ============ Evaluation cases ============

    /// Stored cases in id order, plus the ones whose `expected_paths` is not
    /// a JSON list of strings.
    pub async fn list_test_cases(&self) -> Result<(Vec<TestCase>, Vec<MalformedCase>)> {
        let rows = self
            .fetch(
                "list_test_cases",
                "SELECT id, query, expected_paths, top_k FROM test_cases ORDER BY id",
                &[],
            )
            .await?;

        let mut cases = Vec::new();
        let mut malformed = Vec::new();
        for row in &rows {
            let id: i64 = row.get("id");
            let raw: String = row.get("expected_paths");
            let expected: Vec<String> = match serde_json::from_str(&raw) {
                Ok(paths) => paths,
                Err(e) => {
                    malformed.push(MalformedCase {
                        id,
                        reason: format!("expected_paths is not a list of paths: {}", e),
                    });
                    continue;
                }
            };
            let top_k: i64 = row.get("top_k");
            cases.push(TestCase {
                id,
                query: row.get("query"),
                expected_paths: expected.iter().map(|p| normalize_path(p)).collect(),
                top_k: top_k.max(1) as usize,
            });
        }
        Ok((cases, malformed))
    }

    pub async fn add_test_case(&self, query: &str, expected: &[String], top_k: usize) -> Result<i64> {
        let expected: Vec<String> = expected.iter().map(|p| normalize_path(p)).collect();
        let expected = serde_json::to_string(&expected)?;
        let expected = expected.as_str();
        let top_k = top_k.max(1) as i64;
        self.with_retry("add_test_case", || async move {
            let mut conn = self.conn().await?;
            let id = sqlx::query(
                "INSERT INTO test_cases (query, expected_paths, top_k) VALUES (?1, ?2, ?3)",
            )
            .bind(query)
            .bind(expected)
            .bind(top_k)
            .execute(&mut conn)
            .await?
            .last_insert_rowid();
            conn.close().await?;
            Ok(id)
        })
        .await
    }

    pub async fn append_test_result(&self, result: &TestResult) -> Result<()> {
        let ts = chrono::Utc::now().to_rfc3339();
        let ts = ts.as_str();
        self.with_retry("append_test_result", || async move {
            let mut conn = self.conn().await?;
            sqlx::query(
                r#"
                INSERT INTO test_results
                    (case_id, run_ts, precision_at_k, recall_at_k, mrr, first_rank, elapsed_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(result.case_id)
            .bind(ts)
            .bind(result.precision_at_k)
            .bind(result.recall_at_k)
            .bind(result.mrr)
            .bind(result.first_rank.map(|r| r as i64))
            .bind(result.elapsed_ms as i64)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    // ============ Provisioning writes ============

    pub async fn add_file(&self, path: &str) -> Result<()> {
        let norm = normalize_path(path);
        let norm = norm.as_str();
        let name = basename(path).to_string();
        let name = name.as_str();
        let dir = parent_dir(norm);
        let ext = extension(norm);
        let ext = ext.as_str();
        self.with_retry("add_file", || async move {
            let mut conn = self.conn().await?;
            sqlx::query(
                "INSERT OR IGNORE INTO files (fullpath, name, dir, ext) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(norm)
            .bind(name)
            .bind(dir)
            .bind(ext)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    /// Bind a keyword to a document. Returns `false` when the
    /// case-insensitive pair already exists.
    pub async fn add_keyword(&self, path: &str, keyword: &str, source: &str) -> Result<bool> {
        let norm = normalize_path(path);
        let norm = norm.as_str();
        let keyword = keyword.trim();
        if keyword.is_empty() {
            bail!("keyword must not be empty");
        }
        let now = chrono::Utc::now().to_rfc3339();
        let now = now.as_str();
        self.with_retry("add_keyword", || async move {
            let mut conn = self.conn().await?;
            let existing: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM doc_keywords WHERE lower(fullpath) = lower(?1) AND lower(keyword) = lower(?2)",
            )
            .bind(norm)
            .bind(keyword)
            .fetch_one(&mut conn)
            .await?;
            if existing > 0 {
                conn.close().await?;
                return Ok(false);
            }
            let done = sqlx::query(
                "INSERT OR IGNORE INTO doc_keywords (fullpath, keyword, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(norm)
            .bind(keyword)
            .bind(source)
            .bind(now)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(done.rows_affected() > 0)
        })
        .await
    }

    pub async fn set_note(&self, path: &str, note: &str) -> Result<()> {
        let norm = normalize_path(path);
        let norm = norm.as_str();
        let now = chrono::Utc::now().to_rfc3339();
        let now = now.as_str();
        self.with_retry("set_note", || async move {
            let mut conn = self.conn().await?;
            sqlx::query(
                r#"
                INSERT INTO doc_notes (fullpath, note, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(fullpath) DO UPDATE SET
                    note = excluded.note,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(norm)
            .bind(note)
            .bind(now)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    /// Store a chunk and its vector. Returns the chunk id.
    pub async fn add_chunk(&self, path: &str, chunk_text: &str, vector: &[f32]) -> Result<i64> {
        let norm = normalize_path(path);
        let norm = norm.as_str();
        let blob = vec_to_blob(vector);
        let blob = blob.as_slice();
        self.with_retry("add_chunk", || async move {
            let mut conn = self.conn().await?;
            let mut tx = conn.begin().await?;
            let id = sqlx::query("INSERT INTO chunks (text, file_path) VALUES (?1, ?2)")
                .bind(chunk_text)
                .bind(norm)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
            sqlx::query("INSERT INTO embeddings (chunk_id, vec) VALUES (?1, ?2)")
                .bind(id)
                .bind(blob)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            conn.close().await?;
            Ok(id)
        })
        .await
    }

    pub async fn set_rag_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_retry("set_rag_meta", || async move {
            let mut conn = self.conn().await?;
            sqlx::query(
                "INSERT INTO rag_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    /// Promote a document. Weight is clamped to `[0.1, 10.0]`; the display
    /// name is backfilled from the basename.
    pub async fn pin_source(&self, path: &str, weight: f64, note: &str) -> Result<()> {
        let norm = normalize_path(path);
        let norm = norm.as_str();
        let name = basename(path).to_string();
        let name = name.as_str();
        let weight = if weight.is_finite() {
            weight.clamp(0.1, 10.0)
        } else {
            1.0
        };
        self.with_retry("pin_source", || async move {
            let mut conn = self.conn().await?;
            sqlx::query(
                r#"
                INSERT INTO pinned_sources (path, weight, note, name) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(path) DO UPDATE SET
                    weight = excluded.weight,
                    note = excluded.note,
                    name = COALESCE(pinned_sources.name, excluded.name)
                "#,
            )
            .bind(norm)
            .bind(weight)
            .bind(note)
            .bind(name)
            .execute(&mut conn)
            .await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    pub async fn add_concept(
        &self,
        slug: &str,
        title: &str,
        body: &str,
        tags: &[&str],
        aliases: &[&str],
        sources: &[ConceptSource],
    ) -> Result<i64> {
        let tags = tags.join(",");
        let tags = tags.as_str();
        self.with_retry("add_concept", || async move {
            let mut conn = self.conn().await?;
            let mut tx = conn.begin().await?;
            let id = sqlx::query(
                "INSERT INTO concepts (slug, title, body, tags) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(slug)
            .bind(title)
            .bind(body)
            .bind(tags)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            for alias in aliases {
                sqlx::query("INSERT OR IGNORE INTO concept_alias (concept_id, alias) VALUES (?1, ?2)")
                    .bind(id)
                    .bind(*alias)
                    .execute(&mut *tx)
                    .await?;
            }
            for (position, src) in sources.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO concept_sources (concept_id, path, weight, note, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(id)
                .bind(normalize_path(&src.path))
                .bind(src.weight)
                .bind(&src.note)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            conn.close().await?;
            Ok(id)
        })
        .await
    }
}

// ============ Helpers ============

fn like_pattern(substring: &str) -> String {
    let escaped = substring
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// LIKE pattern that tolerates diacritics: every letter that may carry an
/// accent in the stored text becomes a single-character wildcard. Matches
/// are confirmed on folded text afterwards.
fn loose_like_pattern(substring: &str) -> String {
    let mut out = String::from("%");
    for ch in text::fold(substring).chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            c if ACCENTABLE.contains(c) => out.push('_'),
            c => out.push(c),
        }
    }
    out.push('%');
    out
}

fn scan_cap(limit: usize) -> String {
    (limit.max(1) * SCAN_FACTOR).to_string()
}

fn filter_matches(rows: &[SqliteRow], substring: &str, limit: usize) -> Vec<PathMatch> {
    let needle = text::fold(substring);
    rows.iter()
        .filter_map(|row| {
            let value: String = row.get("value");
            if text::fold(&value).contains(&needle) {
                let fullpath: String = row.get("fullpath");
                Some(PathMatch {
                    path: normalize_path(&fullpath),
                    fullpath,
                    value,
                })
            } else {
                None
            }
        })
        .take(limit)
        .collect()
}

/// Trim, drop empties and case-insensitive duplicates, sort on folded text.
fn distinct_keywords(raw: Vec<String>) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for kw in raw {
        let kw = kw.trim().to_string();
        if kw.is_empty() {
            continue;
        }
        let key = kw.to_lowercase();
        if !keywords.iter().any(|k| k.to_lowercase() == key) {
            keywords.push(kw);
        }
    }
    keywords.sort_by_key(|k| (text::fold(k), k.clone()));
    keywords
}

struct EvidenceBatch {
    keyword_sql: String,
    note_sql: String,
    binds: Vec<String>,
}

/// Split the candidates into IN-list queries of at most `MAX_BINDS` values.
/// Each batch binds the stored spellings first, then the normalized keys.
fn evidence_batches(candidates: &BTreeMap<String, BTreeSet<String>>) -> Vec<EvidenceBatch> {
    let mut batches = Vec::new();
    let mut spellings: Vec<String> = Vec::new();
    let mut keys: Vec<String> = Vec::new();

    let mut flush = |spellings: &mut Vec<String>, keys: &mut Vec<String>| {
        if keys.is_empty() {
            return;
        }
        let raw_list = vec!["?"; spellings.len()].join(", ");
        let key_list = vec!["?"; keys.len()].join(", ");
        let filter = format!(
            "fullpath IN ({}) OR lower(replace(fullpath, '\\', '/')) IN ({})",
            raw_list, key_list
        );
        let mut binds = std::mem::take(spellings);
        binds.append(keys);
        batches.push(EvidenceBatch {
            keyword_sql: format!(
                "SELECT fullpath, keyword FROM doc_keywords WHERE {} ORDER BY id",
                filter
            ),
            note_sql: format!("SELECT fullpath, note FROM doc_notes WHERE {}", filter),
            binds,
        });
    };

    for (key, seen) in candidates {
        let extra = seen.len() + 2;
        if spellings.len() + keys.len() + extra > MAX_BINDS {
            flush(&mut spellings, &mut keys);
        }
        spellings.push(key.clone());
        spellings.extend(seen.iter().filter(|s| *s != key).cloned());
        keys.push(key.clone());
    }
    flush(&mut spellings, &mut keys);
    batches
}

async fn fetch_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[&str],
) -> Result<Vec<SqliteRow>, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for b in binds {
        query = query.bind(*b);
    }
    query.fetch_all(&mut *conn).await
}

/// Rows of a read against a table that may be absent.
fn optional_rows(result: Result<Vec<SqliteRow>, sqlx::Error>) -> Result<Vec<SqliteRow>, sqlx::Error> {
    match result {
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        other => other,
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code_busy = matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
            );
            let msg = db.message().to_lowercase();
            code_busy || msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("no such table"),
        _ => false,
    }
}

fn is_missing_table_anyhow(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .map(is_missing_table)
        .unwrap_or(false)
}
