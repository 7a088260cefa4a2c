//! Index schema provisioning.
//!
//! The scanner and the admin layer normally own these tables; `init` and the
//! test suite create them here so the core can run against an empty index.
//! Every statement is idempotent.

use anyhow::Result;
use sqlx::Connection;
use std::path::Path;

use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        fullpath TEXT PRIMARY KEY COLLATE NOCASE,
        name TEXT NOT NULL,
        dir TEXT NOT NULL,
        ext TEXT NOT NULL DEFAULT '',
        size INTEGER,
        mtime INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS doc_keywords (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fullpath TEXT NOT NULL,
        keyword TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT 'manual',
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_doc_keywords ON doc_keywords(lower(fullpath), lower(keyword))",
    r#"
    CREATE TABLE IF NOT EXISTS doc_notes (
        fullpath TEXT PRIMARY KEY COLLATE NOCASE,
        note TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL,
        file_path TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        chunk_id INTEGER PRIMARY KEY,
        vec BLOB NOT NULL,
        FOREIGN KEY (chunk_id) REFERENCES chunks(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rag_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pinned_sources (
        path TEXT PRIMARY KEY COLLATE NOCASE,
        weight REAL NOT NULL DEFAULT 1.0,
        note TEXT,
        name TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concepts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slug TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_alias (
        concept_id INTEGER NOT NULL,
        alias TEXT NOT NULL,
        UNIQUE(concept_id, alias),
        FOREIGN KEY (concept_id) REFERENCES concepts(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_sources (
        concept_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        weight REAL NOT NULL DEFAULT 1.0,
        note TEXT,
        position INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (concept_id) REFERENCES concepts(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS qa_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        query TEXT NOT NULL,
        answer TEXT NOT NULL,
        model TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS qa_sources (
        qa_id INTEGER NOT NULL,
        rank INTEGER NOT NULL,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        note TEXT NOT NULL DEFAULT '',
        score REAL NOT NULL DEFAULT 0,
        FOREIGN KEY (qa_id) REFERENCES qa_log(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS qa_feedback (
        qa_id INTEGER PRIMARY KEY,
        rating INTEGER NOT NULL CHECK (rating BETWEEN 0 AND 10),
        notes TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL,
        FOREIGN KEY (qa_id) REFERENCES qa_log(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_cases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query TEXT NOT NULL,
        expected_paths TEXT NOT NULL DEFAULT '[]',
        top_k INTEGER NOT NULL DEFAULT 5
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id INTEGER NOT NULL,
        run_ts TEXT NOT NULL,
        precision_at_k REAL NOT NULL,
        recall_at_k REAL NOT NULL,
        mrr REAL NOT NULL,
        first_rank INTEGER,
        elapsed_ms INTEGER NOT NULL,
        FOREIGN KEY (case_id) REFERENCES test_cases(id)
    )
    "#,
];

pub async fn run_migrations(db_path: &Path) -> Result<()> {
    let options = db::options(db_path)?;
    let mut conn = db::connect(&options).await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut conn).await?;
    }

    conn.close().await?;
    Ok(())
}
