//! Conversation turns driven by a scripted generator.

use std::sync::{Arc, Mutex};

use corpus_assistant::budget;
use corpus_assistant::config::Settings;
use corpus_assistant::embedding::{EmbeddingProvider, HashProvider, SIGNATURE_KEY};
use corpus_assistant::events::{EventBus, Level};
use corpus_assistant::generator::recovery::APOLOGY;
use corpus_assistant::generator::{
    ChatChunk, ChatMessage, ChatStream, GenParams, GenerateError, Generator,
};
use corpus_assistant::migrate;
use corpus_assistant::orchestrator::{Orchestrator, TurnKind};
use corpus_assistant::store::Store;
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Mode {
    Stream,
    OverflowOnOpen,
    NotLoaded,
}

struct Scripted {
    ctx: usize,
    mode: Mode,
    chunks: Vec<String>,
    calls: Mutex<Vec<(Vec<ChatMessage>, GenParams)>>,
}

impl Scripted {
    fn new(mode: Mode, chunks: &[&str]) -> Arc<Self> {
        Self::with_ctx(mode, chunks, 512)
    }

    fn with_ctx(mode: Mode, chunks: &[&str], ctx: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            mode,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(Vec<ChatMessage>, GenParams)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Generator for Scripted {
    fn model_id(&self) -> &str {
        "scripted-7b"
    }

    fn context_size(&self) -> usize {
        self.ctx
    }

    fn chat(&self, messages: &[ChatMessage], params: &GenParams) -> Result<String, GenerateError> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), *params));
        match self.mode {
            Mode::NotLoaded => Err(GenerateError::NotLoaded("weights missing".to_string())),
            _ => Ok("recovered answer".to_string()),
        }
    }

    fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenParams,
    ) -> Result<ChatStream, GenerateError> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), *params));
        match self.mode {
            Mode::Stream => {
                let chunks: Vec<Result<ChatChunk, GenerateError>> =
                    self.chunks.iter().map(|c| Ok(ChatChunk::delta(c.clone()))).collect();
                Ok(Box::new(chunks.into_iter()))
            }
            Mode::OverflowOnOpen => Err(GenerateError::Runtime(
                "Requested tokens (900) exceed context window of 512".to_string(),
            )),
            Mode::NotLoaded => Err(GenerateError::NotLoaded("weights missing".to_string())),
        }
    }
}

async fn setup() -> (TempDir, Store, Settings) {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("index.sqlite");
    migrate::run_migrations(&db).await.unwrap();
    let store = Store::open(&db).unwrap();
    let settings = Settings {
        db_path: db,
        model_ctx: 512,
        ..Settings::default()
    };
    (tmp, store, settings)
}

async fn seed(store: &Store) {
    for (path, note) in [
        (
            "/docs/FEAGA/Informe pagos 2023.pdf",
            "Resumen de pagos FEAGA del ejercicio 2023",
        ),
        (
            "/docs/FEAGA/Circular.pdf",
            "Circular sobre FEAGA: pagos directos y plazos",
        ),
        (
            "/docs/FEADER/Anticipos.pdf",
            "Plazo del anticipo FEADER: tres meses desde la resolución",
        ),
    ] {
        store.add_file(path).await.unwrap();
        store.set_note(path, note).await.unwrap();
    }
    store.add_file("/docs/img/logo.png").await.unwrap();
    store
        .add_keyword("/docs/img/logo.png", "feaga", "scan")
        .await
        .unwrap();
}

fn orchestrator(store: Store, settings: Settings, generator: Option<Arc<Scripted>>) -> Orchestrator {
    let generator = generator.map(|g| g as Arc<dyn Generator>);
    Orchestrator::new(store, settings, generator, EventBus::new())
}

async fn history_len(db: &std::path::Path) -> usize {
    Store::open(db).unwrap().list_qa(None, 100).await.unwrap().len()
}

#[tokio::test]
async fn test_greeting_touches_nothing() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    let gen = Scripted::new(Mode::Stream, &["hola"]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let reply = orch.turn("hola", &mut |_: &str| {}).await;
    assert_eq!(reply.kind, TurnKind::Greeting);
    assert!(!reply.text.is_empty());
    assert!(gen.calls().is_empty());
    assert_eq!(history_len(&db).await, 0);
}

#[tokio::test]
async fn test_filter_commands_update_session() {
    let (_tmp, store, settings) = setup().await;
    let mut orch = orchestrator(store, settings, None);

    let reply = orch.turn("solo pdf", &mut |_: &str| {}).await;
    assert_eq!(reply.kind, TurnKind::Filter);
    assert!(reply.text.contains("PDF"));
    assert_eq!(
        orch.session().extension_filter.iter().collect::<Vec<_>>(),
        vec![".pdf"]
    );

    // survives an unrelated turn
    orch.turn("hola", &mut |_: &str| {}).await;
    assert!(orch.session().extension_filter.contains(".pdf"));

    let reply = orch.turn("quitar filtros", &mut |_: &str| {}).await;
    assert_eq!(reply.kind, TurnKind::Filter);
    assert!(orch.session().extension_filter.is_empty());
}

#[tokio::test]
async fn test_explanation_after_index_answer() {
    let (_tmp, store, settings) = setup().await;
    seed(&store).await;
    let mut orch = orchestrator(store, settings, None);

    let first = orch.turn("pagos FEAGA", &mut |_: &str| {}).await;
    assert_eq!(first.kind, TurnKind::IndexOnly);
    assert_eq!(first.hits.len(), 2);
    assert!(first.hits.iter().all(|h| h.ext == ".pdf"));

    let why = orch
        .turn("¿Por qué has elegido este documento?", &mut |_: &str| {})
        .await;
    assert_eq!(why.kind, TurnKind::Explain);
    assert!(why.text.contains("PDF"), "{}", why.text);
    assert!(why.text.contains("FEAGA"), "{}", why.text);
    assert!(why.text.contains("reviewer note"), "{}", why.text);
}

#[tokio::test]
async fn test_listing_has_footer_and_is_persisted() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    seed(&store).await;
    let mut orch = orchestrator(store, settings, None);

    let reply = orch
        .turn("¿Hay documentos sobre pagos FEAGA?", &mut |_: &str| {})
        .await;
    assert_eq!(reply.kind, TurnKind::Listing);
    assert!(reply.text.contains("— Source: index index.sqlite · 2 hits · "));
    assert!(reply.text.contains("route: /docs/feaga/circular.pdf"));
    assert!(reply.qa_id.is_some());
    assert_eq!(history_len(&db).await, 1);
}

#[tokio::test]
async fn test_recommendation_prefers_pinned_source() {
    let (_tmp, store, settings) = setup().await;
    seed(&store).await;
    store
        .pin_source("/docs/FEAGA/Circular.pdf", 2.0, "documento de referencia")
        .await
        .unwrap();
    let mut orch = orchestrator(store, settings, None);

    let reply = orch
        .turn("recomiéndame el mejor documento de pagos FEAGA", &mut |_: &str| {})
        .await;
    assert_eq!(reply.kind, TurnKind::Recommend);
    assert_eq!(reply.hits.len(), 1);
    assert_eq!(reply.hits[0].path, "/docs/feaga/circular.pdf");
    assert_eq!(
        orch.session()
            .last_recommendation
            .as_ref()
            .map(|h| h.path.as_str()),
        Some("/docs/feaga/circular.pdf")
    );
}

#[tokio::test]
async fn test_guardrail_skips_the_model() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    let gen = Scripted::new(Mode::Stream, &["inventado"]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let reply = orch.turn("qwerty", &mut |_: &str| {}).await;
    assert_eq!(reply.kind, TurnKind::Guardrail);
    assert!(gen.calls().is_empty());
    assert_eq!(history_len(&db).await, 0);
}

#[tokio::test]
async fn test_streamed_answer_is_persisted() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    seed(&store).await;
    let gen = Scripted::new(Mode::Stream, &["El plazo ", "es de ", "tres meses [1]."]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let query = "¿Qué plazo tiene el anticipo FEADER?";
    let mut streamed = String::new();
    let reply = orch.turn(query, &mut |t: &str| streamed.push_str(t)).await;

    assert_eq!(reply.kind, TurnKind::Generative);
    assert!(!reply.cancelled);
    assert!(reply.text.starts_with("El plazo es de tres meses [1]."));
    assert!(reply.text.contains("Suggested routes:\n- /docs/feader/anticipos.pdf"));
    assert_eq!(streamed, reply.text);

    let last = Store::open(&db).unwrap().list_qa(None, 1).await.unwrap();
    assert_eq!(last[0].query, query);
    assert_eq!(last[0].answer, reply.text);
    assert_eq!(last[0].model, "scripted-7b");
}

#[tokio::test]
async fn test_oversized_context_is_budgeted() {
    let (_tmp, store, settings) = setup().await;
    seed(&store).await;
    let encoder = HashProvider::new(64);
    for i in 0..6 {
        let text = format!("anticipo FEADER plazo {} ", i).repeat(60);
        let v = encoder.embed(&[text.clone()]).unwrap();
        store
            .add_chunk(&format!("/docs/FEADER/parte-{}.pdf", i), &text, &v[0])
            .await
            .unwrap();
    }
    store.set_rag_meta(SIGNATURE_KEY, "hash:64").await.unwrap();
    let gen = Scripted::new(Mode::Stream, &["Tres meses."]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let reply = orch
        .turn("¿Qué plazo tiene el anticipo FEADER?", &mut |_: &str| {})
        .await;
    assert_eq!(reply.kind, TurnKind::Generative);
    assert!(reply.text.starts_with("Tres meses."));

    let calls = gen.calls();
    assert_eq!(calls.len(), 1);
    let (messages, params) = &calls[0];
    let used = budget::estimate_messages(gen.as_ref(), messages);
    assert!(
        used + params.max_tokens <= 512 - budget::SAFETY_MARGIN,
        "used {} + response {}",
        used,
        params.max_tokens
    );
}

#[tokio::test]
async fn test_overflow_is_recovered() {
    let (_tmp, store, settings) = setup().await;
    seed(&store).await;
    let gen = Scripted::new(Mode::OverflowOnOpen, &[]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let reply = orch
        .turn("¿Qué plazo tiene el anticipo FEADER?", &mut |_: &str| {})
        .await;
    assert_eq!(reply.kind, TurnKind::Generative);
    assert!(reply.text.starts_with("recovered answer"));
    assert_ne!(reply.text, APOLOGY);
    assert_eq!(gen.calls().len(), 2);
}

#[tokio::test]
async fn test_prompt_that_cannot_fit_gets_apology() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    seed(&store).await;
    let gen = Scripted::with_ctx(Mode::Stream, &["nunca"], 96);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));

    let query = "¿Qué plazo tiene el anticipo FEADER cuando la resolución llega tarde y hay controles pendientes?";
    let reply = orch.turn(query, &mut |_: &str| {}).await;
    assert_eq!(reply.kind, TurnKind::Generative);
    assert_eq!(reply.text, APOLOGY);
    assert!(gen.calls().is_empty());
    assert!(orch
        .events()
        .recent()
        .iter()
        .any(|e| e.level == Level::Warn && e.message.contains("does not fit")));
    assert_eq!(history_len(&db).await, 1);
}

#[tokio::test]
async fn test_cancel_truncates_and_persists() {
    let (_tmp, store, settings) = setup().await;
    let db = settings.db_path.clone();
    seed(&store).await;
    let gen = Scripted::new(Mode::Stream, &["uno ", "dos ", "tres ", "cuatro "]);
    let mut orch = orchestrator(store, settings, Some(gen.clone()));
    let cancel = orch.cancel_flag();

    let reply = orch
        .turn("¿Qué plazo tiene el anticipo FEADER?", &mut |_: &str| cancel.cancel())
        .await;
    assert!(reply.cancelled);
    assert_eq!(reply.text, "uno  [truncated]");

    let last = Store::open(&db).unwrap().list_qa(None, 1).await.unwrap();
    assert_eq!(last[0].answer, "uno  [truncated]");
}

#[tokio::test]
async fn test_model_not_loaded_answers_from_index() {
    let (_tmp, store, settings) = setup().await;
    seed(&store).await;
    let gen = Scripted::new(Mode::NotLoaded, &[]);
    let events = EventBus::new();
    let mut orch = Orchestrator::new(
        store,
        settings,
        Some(gen.clone() as Arc<dyn Generator>),
        events.clone(),
    );

    let reply = orch
        .turn("¿Qué plazo tiene el anticipo FEADER?", &mut |_: &str| {})
        .await;
    assert_eq!(reply.kind, TurnKind::IndexOnly);
    assert!(reply.notice.is_some());
    assert!(reply.text.contains("/docs/feader/anticipos.pdf"));
    assert!(events
        .recent()
        .iter()
        .any(|e| e.message.contains("generation failed")));
}
