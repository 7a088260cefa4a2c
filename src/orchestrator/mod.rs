//! Conversation turns.
//!
//! A turn classifies the query ([`intent::classify`]) and then takes one
//! of six paths. Only the generative path calls the model:
//!
//! ```text
//! search → guardrail → fragments → plan → stream → suggested routes → persist
//! ```
//!
//! The session's extension filter survives across turns until cleared and
//! is applied to both retrievers. Recoverable failures become events and a
//! graceful reply; [`Orchestrator::turn`] never returns an error.

pub mod intent;
pub mod motive;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::budget::{self, BudgetParams, PromptInputs};
use crate::config::Settings;
use crate::error::AssistantError;
use crate::events::{CancelFlag, EventBus};
use crate::generator::recovery::{self, Opened};
use crate::generator::{GenParams, GenerateError, Generator};
use crate::models::{Hit, SourceRef};
use crate::rag::{self, RagRetriever};
use crate::retriever::{self, Retriever, RetrieverOptions};
use crate::store::Store;

use intent::{FilterCommand, Intent};

const SOURCE: &str = "orchestrator";
const MAX_SUGGESTED: usize = 3;
const GUARDRAIL_MAX_TOKENS: usize = 2;
const TRUNCATED_MARK: &str = " [truncated]";
const INDEX_MODEL: &str = "index";

const GREETING_REPLY: &str =
    "Hello! Ask me about the documents in the archive, for example \"pagos FEAGA\" or \"only pdf\".";

const POLICY: &str = "Answer only from the context below. Cite fragments as [n] when you use them. \
If the context does not contain the answer, say so and point to the most relevant routes.";

/// Mutable per-conversation state, held by value.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub extension_filter: BTreeSet<String>,
    pub last_hits: Vec<Hit>,
    pub last_recommendation: Option<Hit>,
    pub last_query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Greeting,
    Filter,
    Explain,
    Recommend,
    Listing,
    Generative,
    Guardrail,
    IndexOnly,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: TurnKind,
    pub text: String,
    pub hits: Vec<Hit>,
    /// Set when the turn was persisted.
    pub qa_id: Option<i64>,
    pub cancelled: bool,
    /// User-facing note about a degraded path (e.g. fragments unavailable).
    pub notice: Option<String>,
}

impl Reply {
    fn plain(kind: TurnKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            hits: Vec::new(),
            qa_id: None,
            cancelled: false,
            notice: None,
        }
    }
}

enum StreamItem {
    Text(String),
    Failed(GenerateError),
}

pub struct Orchestrator {
    store: Store,
    settings: Settings,
    generator: Option<Arc<dyn Generator>>,
    rag: RagRetriever,
    events: EventBus,
    cancel: CancelFlag,
    session: Session,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        settings: Settings,
        generator: Option<Arc<dyn Generator>>,
        events: EventBus,
    ) -> Self {
        let rag = RagRetriever::new(settings.resolved_embedding_dir()).with_events(events.clone());
        Self {
            store,
            settings,
            generator,
            rag,
            events,
            cancel: CancelFlag::new(),
            session: Session::default(),
        }
    }

    /// Flag polled once per streamed chunk; set it to stop a generation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Replace the session filter without a turn. Empty clears it.
    pub fn set_extension_filter(&mut self, exts: BTreeSet<String>) {
        self.session.extension_filter = exts;
    }

    fn extra_stopwords(&self) -> Vec<String> {
        vec![self.settings.assistant_name.clone()]
    }

    fn retriever(&self) -> Retriever<'_> {
        Retriever::new(
            &self.store,
            &self.events,
            RetrieverOptions {
                note_chars: self.settings.note_chars,
                extra_stopwords: self.extra_stopwords(),
            },
        )
    }

    /// Session filter, or one inferred from the query when none is set.
    fn filter_for(&self, query: &str) -> BTreeSet<String> {
        if self.session.extension_filter.is_empty() {
            rag::infer_ext_filter(query)
        } else {
            self.session.extension_filter.clone()
        }
    }

    /// Run one turn. Text is delivered through `on_chunk` as it is produced;
    /// the returned [`Reply`] carries the full text.
    pub async fn turn(&mut self, query: &str, on_chunk: &mut (dyn FnMut(&str) + Send)) -> Reply {
        let reply = match intent::classify(query, &self.settings.assistant_name) {
            Intent::Greeting => Reply::plain(TurnKind::Greeting, GREETING_REPLY),
            Intent::Filter(cmd) => self.apply_filter(cmd),
            Intent::Explain => self.explain(),
            Intent::Recommend => self.recommend(query).await,
            Intent::Listing => self.listing(query).await,
            Intent::Generative => return self.generative(query, on_chunk).await,
        };
        on_chunk(&reply.text);
        reply
    }

    fn apply_filter(&mut self, cmd: FilterCommand) -> Reply {
        let text = match cmd {
            FilterCommand::Clear => {
                self.session.extension_filter.clear();
                "Filters cleared; searching all formats.".to_string()
            }
            FilterCommand::Only(exts) => {
                let label = exts
                    .iter()
                    .map(|e| motive::ext_label(e))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.session.extension_filter = exts;
                format!("Filter set: only {} from now on.", label)
            }
        };
        self.events.info(SOURCE, text.clone());
        Reply::plain(TurnKind::Filter, text)
    }

    fn explain(&self) -> Reply {
        let target = self
            .session
            .last_recommendation
            .as_ref()
            .or_else(|| self.session.last_hits.first());
        let Some(hit) = target else {
            return Reply::plain(
                TurnKind::Explain,
                "I have not recommended anything yet. Ask me a question first.",
            );
        };
        let text = motive::explain(hit, &self.session.last_query, &self.extra_stopwords());
        let mut reply = Reply::plain(TurnKind::Explain, text);
        reply.hits = vec![hit.clone()];
        reply
    }

    async fn recommend(&mut self, query: &str) -> Reply {
        let filter = self.filter_for(query);
        let hits = self
            .retriever()
            .search(query, &filter, self.settings.top_k)
            .await;
        let pinned = match self.store.pinned_sources().await {
            Ok(p) => p,
            Err(e) => {
                self.events
                    .warn(SOURCE, format!("pinned sources unavailable: {:#}", e));
                Vec::new()
            }
        };
        let Some(best) = motive::choose_best(&hits, query, &pinned) else {
            return Reply::plain(
                TurnKind::Recommend,
                AssistantError::EmptyQuery.user_message(),
            );
        };

        let text = format!(
            "I recommend {} ({}).\nReason: {}.",
            best.name,
            best.path,
            motive::short_motive(&best, query, &self.extra_stopwords())
        );
        let qa_id = self
            .persist(query, &text, INDEX_MODEL, std::slice::from_ref(&best))
            .await;
        self.remember(query, &hits, Some(best.clone()));

        let mut reply = Reply::plain(TurnKind::Recommend, text);
        reply.hits = vec![best];
        reply.qa_id = qa_id;
        reply
    }

    async fn listing(&mut self, query: &str) -> Reply {
        let started = Instant::now();
        let filter = self.filter_for(query);
        let hits = self
            .retriever()
            .search(query, &filter, self.settings.top_k)
            .await;
        let text = listing_text(&hits, &self.settings.db_name(), started.elapsed().as_millis());
        let qa_id = self.persist(query, &text, INDEX_MODEL, &hits).await;
        self.remember(query, &hits, None);

        let mut reply = Reply::plain(TurnKind::Listing, text);
        reply.hits = hits;
        reply.qa_id = qa_id;
        reply
    }

    async fn generative(&mut self, query: &str, on_chunk: &mut (dyn FnMut(&str) + Send)) -> Reply {
        self.cancel.reset();
        let filter = self.filter_for(query);
        let hits = self
            .retriever()
            .search(query, &filter, self.settings.top_k)
            .await;

        let parsed = retriever::parse_query(query, &self.extra_stopwords());
        if parsed.tokens.len() <= GUARDRAIL_MAX_TOKENS
            && hits.is_empty()
            && self.session.last_hits.is_empty()
        {
            let reply = Reply::plain(TurnKind::Guardrail, AssistantError::EmptyQuery.user_message());
            on_chunk(&reply.text);
            return reply;
        }

        let Some(generator) = self.generator.clone() else {
            return self
                .index_only(query, hits, "no model configured", on_chunk)
                .await;
        };

        let mut notice = None;
        let fragments = match self
            .rag
            .fragments(&self.store, query, &filter, self.settings.rag_k)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                if let Some(err) = e.downcast_ref::<AssistantError>() {
                    if matches!(err, AssistantError::EmbeddingDimMismatch { .. }) {
                        notice = Some(err.user_message().to_string());
                    }
                }
                self.events
                    .warn(SOURCE, format!("fragments unavailable: {:#}", e));
                Vec::new()
            }
        };
        let concepts = match self.store.concepts_matching(query).await {
            Ok(c) => c,
            Err(e) => {
                self.events.warn(SOURCE, format!("concepts unavailable: {:#}", e));
                Vec::new()
            }
        };
        let pinned = match self.store.pinned_sources().await {
            Ok(p) => p,
            Err(e) => {
                self.events
                    .warn(SOURCE, format!("pinned sources unavailable: {:#}", e));
                Vec::new()
            }
        };

        let persona = format!(
            "You are {}, an assistant that answers questions about a local document archive.",
            self.settings.assistant_name
        );
        let inputs = PromptInputs {
            persona: &persona,
            policy: POLICY,
            concepts: &concepts,
            hits: &hits,
            pinned: &pinned,
            fragments: &fragments,
            user_text: query,
        };
        let params = BudgetParams {
            ctx: self.settings.effective_ctx().min(generator.context_size()),
            requested_response: self.settings.max_tokens,
            top_k: self.settings.top_k,
            note_chars: self.settings.note_chars,
            rag_k: self.settings.rag_k,
            rag_max_chars: self.settings.rag_max_chars,
        };
        let plan = match budget::plan(generator.as_ref(), &inputs, &params) {
            Ok(plan) => plan,
            Err(e) => {
                self.events.warn(SOURCE, format!("prompt does not fit: {}", e));
                let text = recovery::APOLOGY.to_string();
                on_chunk(&text);
                let qa_id = self.persist(query, &text, generator.model_id(), &hits).await;
                self.remember(query, &hits, None);
                return Reply {
                    kind: TurnKind::Generative,
                    text,
                    hits,
                    qa_id,
                    cancelled: false,
                    notice,
                };
            }
        };
        tracing::debug!(
            estimated = plan.estimated_tokens,
            response = plan.response_budget,
            hits = plan.hits_used.len(),
            fragments = plan.fragments_used,
            "prompt planned"
        );

        let gen_params = GenParams {
            temperature: self.settings.temperature,
            max_tokens: plan.response_budget,
        };
        let (mut answer, cancelled, failure) =
            self.stream(generator.clone(), plan.messages, gen_params, on_chunk).await;

        if answer.is_empty() && !cancelled {
            if let Some(e) = failure {
                let reason = match &e {
                    GenerateError::NotLoaded(m) => AssistantError::ModelNotLoaded(m.clone()).to_string(),
                    other => other.to_string(),
                };
                self.events.warn(SOURCE, format!("generation failed: {}", reason));
                return self.index_only(query, hits, &reason, on_chunk).await;
            }
        } else if let Some(e) = failure {
            self.events
                .warn(SOURCE, format!("generation stopped early: {}", e));
        }

        if cancelled {
            answer.push_str(TRUNCATED_MARK);
            on_chunk(TRUNCATED_MARK);
            self.events.info(SOURCE, AssistantError::Cancelled.to_string());
        } else {
            let routes = suggested_routes(&plan.hits_used);
            if !routes.is_empty() {
                answer.push_str(&routes);
                on_chunk(&routes);
            }
        }

        let qa_id = self
            .persist(query, &answer, generator.model_id(), &plan.hits_used)
            .await;
        self.remember(query, &hits, None);

        Reply {
            kind: TurnKind::Generative,
            text: answer,
            hits,
            qa_id,
            cancelled,
            notice,
        }
    }

    /// Drive the generator on a blocking worker and relay chunks in order.
    async fn stream(
        &self,
        generator: Arc<dyn Generator>,
        messages: Vec<crate::generator::ChatMessage>,
        params: GenParams,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> (String, bool, Option<GenerateError>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        let worker = tokio::task::spawn_blocking(move || {
            match recovery::open_stream(generator.as_ref(), &messages, &params) {
                Ok(Opened::Recovered(text)) => {
                    let _ = tx.send(StreamItem::Text(text));
                }
                Ok(Opened::Streaming { first, rest }) => {
                    if let Some(chunk) = first {
                        if tx.send(StreamItem::Text(chunk.content().to_string())).is_err() {
                            return;
                        }
                    }
                    for item in rest {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let sent = match item {
                            Ok(chunk) => tx.send(StreamItem::Text(chunk.content().to_string())),
                            Err(e) => {
                                let _ = tx.send(StreamItem::Failed(e));
                                break;
                            }
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(StreamItem::Failed(e));
                }
            }
        });

        let mut answer = String::new();
        let mut failure = None;
        while let Some(item) = rx.recv().await {
            match item {
                StreamItem::Text(t) if t.is_empty() => {}
                StreamItem::Text(t) => {
                    answer.push_str(&t);
                    on_chunk(&t);
                }
                StreamItem::Failed(e) => failure = Some(e),
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        drop(rx);
        if let Err(e) = worker.await {
            self.events.error(SOURCE, format!("generator worker failed: {}", e));
        }
        (answer, self.cancel.is_cancelled(), failure)
    }

    async fn index_only(
        &mut self,
        query: &str,
        hits: Vec<Hit>,
        reason: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Reply {
        tracing::info!(reason, "answering from the index only");
        let notice = AssistantError::ModelNotLoaded(reason.to_string()).user_message();
        let mut text = String::from(notice);
        if hits.is_empty() {
            text.push_str("\nNo documents in the index match the question.");
        }
        for (i, h) in hits.iter().enumerate() {
            text.push_str(&format!("\n{}. {} | {}", i + 1, h.name, h.path));
            if !h.note.is_empty() {
                text.push_str(&format!("\n   {}", h.note));
            }
        }
        on_chunk(&text);
        let qa_id = self.persist(query, &text, INDEX_MODEL, &hits).await;
        self.remember(query, &hits, None);

        Reply {
            kind: TurnKind::IndexOnly,
            text,
            hits,
            qa_id,
            cancelled: false,
            notice: Some(notice.to_string()),
        }
    }

    /// Append to the Q&A log. Failures become a WARN event.
    async fn persist(&self, query: &str, answer: &str, model: &str, hits: &[Hit]) -> Option<i64> {
        let sources: Vec<SourceRef> = hits.iter().map(SourceRef::from).collect();
        match self.store.append_qa(query, answer, model, &sources).await {
            Ok(id) => Some(id),
            Err(e) => {
                let err = AssistantError::Persistence(format!("{:#}", e));
                self.events.warn(SOURCE, err.to_string());
                None
            }
        }
    }

    fn remember(&mut self, query: &str, hits: &[Hit], recommendation: Option<Hit>) {
        if !hits.is_empty() {
            self.session.last_hits = hits.to_vec();
            self.session.last_query = query.to_string();
            self.session.last_recommendation = recommendation;
        }
    }
}

fn listing_text(hits: &[Hit], db_name: &str, elapsed_ms: u128) -> String {
    let mut s = String::new();
    if hits.is_empty() {
        s.push_str("I found no documents about that in the index.");
    } else {
        s.push_str("These documents match:");
        for (i, h) in hits.iter().enumerate() {
            s.push_str(&format!("\n{}. {}\n   route: {}", i + 1, h.name, h.path));
            if !h.note.is_empty() {
                s.push_str(&format!("\n   observation: {}", h.note));
            }
        }
    }
    s.push_str(&format!(
        "\n\n— Source: index {} · {} hits · {} ms",
        db_name,
        hits.len(),
        elapsed_ms
    ));
    s
}

fn suggested_routes(hits: &[Hit]) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut s = String::from("\n\nSuggested routes:");
    for h in hits.iter().take(MAX_SUGGESTED) {
        s.push_str(&format!("\n- {}", h.path));
    }
    s
}
