//! Lexical retrieval and store behaviour against a real SQLite file.

use std::collections::BTreeSet;
use std::time::Duration;

use corpus_assistant::config::Settings;
use corpus_assistant::db;
use corpus_assistant::error::AssistantError;
use corpus_assistant::eval;
use corpus_assistant::events::{CancelFlag, EventBus, Level};
use corpus_assistant::migrate;
use corpus_assistant::models::{ConceptSource, SourceRef};
use corpus_assistant::retriever::{Retriever, RetrieverOptions};
use corpus_assistant::store::Store;
use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;

async fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("data").join("index.sqlite");
    migrate::run_migrations(&db).await.unwrap();
    let store = Store::open(&db).unwrap();
    (tmp, store)
}

async fn add_doc(store: &Store, path: &str, keywords: &[&str], note: &str) {
    store.add_file(path).await.unwrap();
    for kw in keywords {
        store.add_keyword(path, kw, "manual").await.unwrap();
    }
    if !note.is_empty() {
        store.set_note(path, note).await.unwrap();
    }
}

/// Two PDFs with FEAGA payment notes and a PNG tagged "feaga".
async fn seed_feaga(store: &Store) {
    add_doc(
        store,
        "/docs/FEAGA/Informe pagos 2023.pdf",
        &[],
        "Resumen de pagos FEAGA del ejercicio 2023",
    )
    .await;
    add_doc(
        store,
        "/docs/FEAGA/Circular.pdf",
        &[],
        "Circular sobre FEAGA: pagos directos y plazos",
    )
    .await;
    add_doc(store, "/docs/img/logo.png", &["feaga"], "").await;
}

async fn raw_conn(store: &Store) -> SqliteConnection {
    db::connect(&db::options(store.db_path()).unwrap())
        .await
        .unwrap()
}

fn options() -> RetrieverOptions {
    RetrieverOptions {
        note_chars: 240,
        extra_stopwords: vec!["asistente".to_string()],
    }
}

fn filter(exts: &[&str]) -> BTreeSet<String> {
    exts.iter().map(|e| e.to_string()).collect()
}

#[tokio::test]
async fn test_format_preference_drops_image() {
    let (_tmp, store) = setup().await;
    seed_feaga(&store).await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("pagos FEAGA", &BTreeSet::new(), 5).await;
    assert_eq!(hits.len(), 2, "{:?}", hits);
    assert!(hits.iter().all(|h| h.ext == ".pdf"));
    assert!(hits.iter().all(|h| !h.note.is_empty()));
}

#[tokio::test]
async fn test_extension_filter_is_honoured() {
    let (_tmp, store) = setup().await;
    seed_feaga(&store).await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("pagos FEAGA", &filter(&[".png"]), 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/docs/img/logo.png");
    assert_eq!(hits[0].keywords, "feaga");
}

#[tokio::test]
async fn test_must_any_and_must_not() {
    let (_tmp, store) = setup().await;
    add_doc(&store, "/docs/a.pdf", &[], "Convocatoria FEADER de inversiones").await;
    add_doc(&store, "/docs/b.pdf", &[], "FEADER y controles SIGC").await;
    add_doc(&store, "/docs/c.pdf", &["inversiones"], "Programa general").await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("FEADER sin SIGC", &BTreeSet::new(), 5).await;
    let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
    assert_eq!(paths, vec!["/docs/a.pdf"]);
}

#[tokio::test]
async fn test_synonym_satisfies_must_any() {
    let (_tmp, store) = setup().await;
    add_doc(&store, "/docs/pdr.pdf", &[], "Medidas de desarrollo rural 2014-2020").await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("FEADER", &BTreeSet::new(), 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/docs/pdr.pdf");
}

#[tokio::test]
async fn test_empty_query_returns_nothing() {
    let (_tmp, store) = setup().await;
    seed_feaga(&store).await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    for q in ["", "¿¡ de la !?", "hola asistente", "a b c"] {
        assert!(
            retriever.search(q, &BTreeSet::new(), 5).await.is_empty(),
            "{:?}",
            q
        );
    }
}

#[tokio::test]
async fn test_accent_insensitive_match() {
    let (_tmp, store) = setup().await;
    add_doc(&store, "/docs/liq.pdf", &["Liquidación"], "").await;
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("liquidacion", &BTreeSet::new(), 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/docs/liq.pdf");
}

#[tokio::test]
async fn test_keywords_case_insensitively_unique() {
    let (_tmp, store) = setup().await;
    assert!(store.add_keyword("/Docs/X.pdf", "FEAGA", "scan").await.unwrap());
    assert!(!store.add_keyword("/docs/x.pdf", "feaga", "manual").await.unwrap());
    assert!(store.add_keyword("/docs/x.pdf", "Pagos", "manual").await.unwrap());

    let kws = store.keywords_for("/DOCS/x.PDF").await.unwrap();
    assert_eq!(kws, vec!["FEAGA".to_string(), "Pagos".to_string()]);
}

#[tokio::test]
async fn test_missing_optional_tables_read_empty() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("bare.sqlite")).unwrap();
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    assert!(retriever
        .try_search("pagos FEAGA", &BTreeSet::new(), 5)
        .await
        .unwrap()
        .is_empty());
    assert!(store.chunks_and_vectors().await.unwrap().is_empty());
    assert!(store.pinned_sources().await.unwrap().is_empty());
    assert!(store.concepts_matching("feader").await.unwrap().is_empty());
    assert!(store.list_qa(None, 5).await.unwrap().is_empty());
    assert_eq!(store.rag_meta("embedding_sig", "none").await.unwrap(), "none");
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_backing_error_becomes_warn_event() {
    let tmp = TempDir::new().unwrap();
    let junk = tmp.path().join("junk.sqlite");
    std::fs::write(&junk, vec![0x5a_u8; 8192]).unwrap();
    let store = Store::open(&junk).unwrap();
    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());

    let hits = retriever.search("pagos FEAGA", &BTreeSet::new(), 5).await;
    assert!(hits.is_empty());
    let recent = events.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].level, Level::Warn);
    assert_eq!(recent[0].source, "retriever");
}

#[tokio::test]
async fn test_qa_log_append_rate_and_list() {
    let (_tmp, store) = setup().await;
    let sources: Vec<SourceRef> = (0..7)
        .map(|i| SourceRef {
            name: format!("doc{}.pdf", i),
            path: format!("/docs/doc{}.pdf", i),
            note: String::new(),
            score: 10.0 - i as f64,
        })
        .collect();
    let first = store
        .append_qa("pagos FEAGA", "Respuesta uno", "qwen2", &sources)
        .await
        .unwrap();
    let second = store
        .append_qa("plazo FEADER", "Respuesta dos", "qwen2", &[])
        .await
        .unwrap();
    assert!(second > first);

    assert_eq!(store.qa_sources(first).await.unwrap().len(), 5);
    store.set_rating(first, 8, "útil").await.unwrap();
    assert!(store.set_rating(first, 11, "").await.is_err());
    assert!(store.set_rating(9999, 5, "").await.is_err());

    let all = store.list_qa(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second);
    assert_eq!(all[1].rating, Some(8));
    assert_eq!(all[1].feedback.as_deref(), Some("útil"));

    let filtered = store.list_qa(Some("FEAGA"), 10).await.unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].query, "pagos FEAGA");
}

#[tokio::test]
async fn test_pinned_and_concepts() {
    let (_tmp, store) = setup().await;
    store
        .pin_source("/Docs/Manual Controles.pdf", 50.0, "referencia")
        .await
        .unwrap();
    let pinned = store.pinned_sources().await.unwrap();
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].path, "/docs/manual controles.pdf");
    assert_eq!(pinned[0].weight, 10.0);

    store
        .add_concept(
            "programa-desarrollo-rural",
            "Programa de Desarrollo Rural",
            "Marco de ayudas FEADER.",
            &["feader"],
            &["PDR"],
            &[ConceptSource {
                path: "/docs/pdr.pdf".to_string(),
                weight: 1.0,
                note: String::new(),
            }],
        )
        .await
        .unwrap();
    let concepts = store.concepts_matching("¿Qué cubre el PDR?").await.unwrap();
    assert_eq!(concepts.len(), 1);
    assert_eq!(concepts[0].sources[0].path, "/docs/pdr.pdf");
    assert!(store.concepts_matching("calendario").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rows_written_with_windows_paths_are_found() {
    let (_tmp, store) = setup().await;
    let mut conn = raw_conn(&store).await;
    sqlx::query(
        "INSERT INTO doc_keywords (fullpath, keyword, source, created_at) \
         VALUES ('C:\\Docs\\Informe.PDF', 'feader', 'scan', '2024-01-01T00:00:00Z')",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO doc_notes (fullpath, note, updated_at) \
         VALUES ('C:\\Docs\\Informe.PDF', 'Manual FEADER de pagos', '2024-01-01T00:00:00Z')",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();

    assert_eq!(
        store.keywords_for("c:/docs/informe.pdf").await.unwrap(),
        vec!["feader".to_string()]
    );
    assert_eq!(
        store.note_for("C:\\Docs\\Informe.PDF").await.unwrap(),
        "Manual FEADER de pagos"
    );

    let events = EventBus::new();
    let retriever = Retriever::new(&store, &events, options());
    for q in ["feader pagos", "manual feader"] {
        let hits = retriever.try_search(q, &BTreeSet::new(), 5).await.unwrap();
        assert_eq!(hits.len(), 1, "{:?}", q);
        assert_eq!(hits[0].path, "c:/docs/informe.pdf");
        assert_eq!(hits[0].keywords, "feader");
        assert_eq!(hits[0].note, "Manual FEADER de pagos");
    }
}

#[tokio::test]
async fn test_name_match_without_files_table() {
    let (_tmp, store) = setup().await;
    let mut conn = raw_conn(&store).await;
    sqlx::query("DROP TABLE files").execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    store
        .add_keyword("/docs/FEADER/anexo.pdf", "controles", "manual")
        .await
        .unwrap();
    store.set_note("/docs/otros/acta.pdf", "Acta de la reunión").await.unwrap();

    assert_eq!(
        store.name_or_dir_like("feader", 5).await.unwrap(),
        vec!["/docs/feader/anexo.pdf".to_string()]
    );
    assert_eq!(
        store.name_or_dir_like("acta", 5).await.unwrap(),
        vec!["/docs/otros/acta.pdf".to_string()]
    );
    assert!(store.name_or_dir_like("circular", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_locked_database_reports_unavailable() {
    let (_tmp, store) = setup().await;
    let store = store.with_busy_timeout(Duration::from_millis(10));
    let mut lock = raw_conn(&store).await;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut lock).await.unwrap();

    let err = store
        .append_qa("pagos FEAGA", "Respuesta", "qwen2", &[])
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<AssistantError>(),
            Some(AssistantError::StoreUnavailable(_))
        ),
        "{:#}",
        err
    );

    sqlx::query("ROLLBACK").execute(&mut lock).await.unwrap();
    lock.close().await.unwrap();
    assert!(store.list_qa(None, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_write_retries_until_lock_is_released() {
    let (_tmp, store) = setup().await;
    let store = store.with_busy_timeout(Duration::from_millis(10));
    let mut lock = raw_conn(&store).await;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut lock).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("COMMIT").execute(&mut lock).await.unwrap();
        lock.close().await.unwrap();
    });

    let id = store
        .append_qa("pagos FEAGA", "Respuesta", "qwen2", &[])
        .await
        .unwrap();
    release.await.unwrap();
    let rows = store.list_qa(None, 5).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
}

#[tokio::test]
async fn test_malformed_eval_case_is_skipped_with_warning() {
    let (_tmp, store) = setup().await;
    seed_feaga(&store).await;
    let good = store
        .add_test_case("pagos FEAGA", &["/docs/FEAGA/Circular.pdf".to_string()], 5)
        .await
        .unwrap();
    let mut conn = raw_conn(&store).await;
    sqlx::query(
        "INSERT INTO test_cases (query, expected_paths, top_k) \
         VALUES ('circular FEAGA', '/docs/FEAGA/Circular.pdf', 5)",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();

    let (cases, malformed) = store.list_test_cases().await.unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(malformed.len(), 1);
    assert!(malformed[0].id > good);

    let events = EventBus::new();
    let results = eval::run(&store, &Settings::default(), &CancelFlag::new(), &events)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].case_id, good);
    assert!(events.recent().iter().any(|e| e.level == Level::Warn
        && e.source == "eval"
        && e.message.contains(&format!("skipping case {}", malformed[0].id))));
}

#[tokio::test]
async fn test_keyword_lookup_is_capped_with_exact_spellings_first() {
    let (_tmp, store) = setup().await;
    for i in 0..6 {
        store
            .add_keyword(&format!("/docs/acentos/{}.pdf", i), "Feáder", "scan")
            .await
            .unwrap();
    }
    for i in 0..3 {
        store
            .add_keyword(&format!("/docs/exactos/{}.pdf", i), "FEADER", "scan")
            .await
            .unwrap();
    }

    let top = store.keyword_like("feader", 3).await.unwrap();
    assert_eq!(top.len(), 3);
    assert!(top.iter().all(|(p, kw)| p.starts_with("/docs/exactos/") && kw == "FEADER"));
    assert_eq!(store.keyword_like("feader", 20).await.unwrap().len(), 9);
}
