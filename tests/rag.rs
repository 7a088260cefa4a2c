//! Dense fragment retrieval over hash-signature indexes.

use std::collections::BTreeSet;

use corpus_assistant::embedding::{EmbeddingProvider, HashProvider, SIGNATURE_KEY};
use corpus_assistant::error::AssistantError;
use corpus_assistant::events::{EventBus, Level};
use corpus_assistant::migrate;
use corpus_assistant::rag::{pack_fragments, RagRetriever};
use corpus_assistant::store::Store;
use tempfile::TempDir;

const DIMS: usize = 256;

async fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("index.sqlite");
    migrate::run_migrations(&db).await.unwrap();
    let store = Store::open(&db).unwrap();
    (tmp, store)
}

async fn add_chunks(store: &Store, chunks: &[(&str, &str)]) {
    let encoder = HashProvider::new(DIMS);
    for (path, text) in chunks {
        let v = encoder.embed(&[text.to_string()]).unwrap();
        store.add_chunk(path, text, &v[0]).await.unwrap();
    }
    store
        .set_rag_meta(SIGNATURE_KEY, &format!("hash:{}", DIMS))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_most_similar_chunk_first() {
    let (_tmp, store) = setup().await;
    add_chunks(
        &store,
        &[
            ("/docs/a.pdf", "El anticipo FEADER se abona en el plazo de tres meses"),
            ("/docs/b.pdf", "Controles sobre el terreno del sistema integrado"),
            ("/docs/c.pdf", "Calendario de solicitudes de la campaña"),
        ],
    )
    .await;
    let rag = RagRetriever::new(None);

    let frags = rag
        .fragments(&store, "anticipo FEADER plazo tres meses", &BTreeSet::new(), 2)
        .await
        .unwrap();
    assert_eq!(frags.len(), 2);
    assert_eq!(frags[0].path, "/docs/a.pdf");
    assert!(frags[0].score >= frags[1].score);
}

#[tokio::test]
async fn test_no_embeddings_means_no_fragments() {
    let (_tmp, store) = setup().await;
    let rag = RagRetriever::new(None);
    let frags = rag
        .fragments(&store, "anticipo FEADER", &BTreeSet::new(), 4)
        .await
        .unwrap();
    assert!(frags.is_empty());
}

#[tokio::test]
async fn test_dimension_mismatch_is_an_error() {
    let (_tmp, store) = setup().await;
    let short = HashProvider::new(32)
        .embed(&["anticipo FEADER".to_string()])
        .unwrap();
    store
        .add_chunk("/docs/a.pdf", "anticipo FEADER", &short[0])
        .await
        .unwrap();
    store.set_rag_meta(SIGNATURE_KEY, "hash:64").await.unwrap();
    let rag = RagRetriever::new(None);

    let err = rag
        .fragments(&store, "anticipo FEADER", &BTreeSet::new(), 4)
        .await
        .unwrap_err();
    match err.downcast_ref::<AssistantError>() {
        Some(AssistantError::EmbeddingDimMismatch { stored, runtime }) => {
            assert_eq!((*stored, *runtime), (32, 64));
        }
        other => panic!("expected dimension mismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_only_pdf_inferred_from_query() {
    let (_tmp, store) = setup().await;
    add_chunks(
        &store,
        &[
            ("/docs/a.docx", "anticipo FEADER plazo"),
            ("/docs/b.pdf", "anticipo FEADER condiciones"),
            ("/docs/c.txt", "anticipo FEADER notas"),
        ],
    )
    .await;
    let rag = RagRetriever::new(None);

    let frags = rag
        .fragments(&store, "solo pdf: anticipo FEADER", &BTreeSet::new(), 4)
        .await
        .unwrap();
    assert_eq!(frags.len(), 1);
    assert_eq!(frags[0].path, "/docs/b.pdf");

    let explicit: BTreeSet<String> = [".docx".to_string()].into_iter().collect();
    let frags = rag
        .fragments(&store, "solo pdf: anticipo FEADER", &explicit, 4)
        .await
        .unwrap();
    assert_eq!(frags.len(), 1);
    assert_eq!(frags[0].path, "/docs/a.docx");
}

#[tokio::test]
async fn test_packed_fragments_cite_sources() {
    let (_tmp, store) = setup().await;
    add_chunks(
        &store,
        &[
            ("/docs/a.pdf", "El anticipo FEADER se abona en tres meses"),
            ("/docs/b.pdf", "Otro texto sobre anticipos"),
        ],
    )
    .await;
    let rag = RagRetriever::new(None);
    let frags = rag
        .fragments(&store, "anticipo FEADER", &BTreeSet::new(), 2)
        .await
        .unwrap();

    let packed = pack_fragments(&frags, 2, 600);
    assert!(packed.starts_with("[1] "));
    assert!(packed.contains("\n\n[2] "));
    assert_eq!(packed.matches("\nFuente: /docs/").count(), 2);
}

#[tokio::test]
async fn test_unsigned_index_warns_and_still_answers() {
    let (_tmp, store) = setup().await;
    let encoder = HashProvider::new(DIMS);
    let v = encoder
        .embed(&["El anticipo FEADER se abona en tres meses".to_string()])
        .unwrap();
    store
        .add_chunk("/docs/a.pdf", "El anticipo FEADER se abona en tres meses", &v[0])
        .await
        .unwrap();
    let events = EventBus::new();
    let rag = RagRetriever::new(None).with_events(events.clone());

    let frags = rag
        .fragments(&store, "anticipo FEADER", &BTreeSet::new(), 4)
        .await
        .unwrap();
    assert_eq!(frags.len(), 1);
    assert_eq!(frags[0].path, "/docs/a.pdf");

    let warned: Vec<_> = events
        .recent()
        .into_iter()
        .filter(|e| e.level == Level::Warn && e.source == "rag")
        .collect();
    assert_eq!(warned.len(), 1);
    assert!(warned[0].message.contains(SIGNATURE_KEY));
}
