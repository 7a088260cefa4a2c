//! llama.cpp backend via `llama-cpp-2`.
//!
//! The model loads on a background thread at construction; the first call
//! that needs it joins the loader. Each chat creates a fresh context, so
//! turns never share KV state. Streaming runs the decode loop on a worker
//! thread and hands UTF-8-complete pieces over a bounded channel; dropping
//! the stream stops the worker at the next token.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use super::format::ChatFormat;
use super::{inference_threads, ChatChunk, ChatMessage, ChatStream, GenParams, GenerateError, Generator};

const DEFAULT_BATCH: u32 = 512;
const STREAM_BUFFER: usize = 32;
const TOP_P: f32 = 0.9;
const TOP_K: i32 = 40;
const SEED: u32 = 42;

enum LoadState {
    Loading(JoinHandle<Result<Loaded, String>>),
    Ready(Loaded),
    Failed(String),
}

#[derive(Clone)]
struct Loaded {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
}

#[derive(Clone, Copy)]
struct RunConfig {
    n_ctx: u32,
    n_threads: i32,
    n_batch: u32,
}

pub struct LlamaGenerator {
    state: RwLock<LoadState>,
    model_id: String,
    format: ChatFormat,
    run: RunConfig,
}

impl std::fmt::Debug for LlamaGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaGenerator")
            .field("model_id", &self.model_id)
            .field("format", &self.format)
            .field("n_ctx", &self.run.n_ctx)
            .finish()
    }
}

impl LlamaGenerator {
    /// Validate the path and start loading in the background.
    pub fn load(model_path: &Path, ctx: usize, gpu_layers: Option<u32>) -> Result<Self, GenerateError> {
        if !model_path.exists() {
            return Err(GenerateError::NotLoaded(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        let model_id = model_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("llama-cpp-model")
            .to_string();
        let format = ChatFormat::detect(model_path);
        let n_threads = inference_threads() as i32;

        let path: PathBuf = model_path.to_path_buf();
        let gpu = gpu_layers.unwrap_or(0);
        let handle = std::thread::Builder::new()
            .name("model-loader".to_string())
            .spawn(move || load_model_sync(&path, gpu))
            .map_err(|e| GenerateError::NotLoaded(format!("cannot spawn loader: {}", e)))?;

        tracing::info!(model = %model_id, ?format, ctx, n_threads, "loading model");
        Ok(Self {
            state: RwLock::new(LoadState::Loading(handle)),
            model_id,
            format,
            run: RunConfig {
                n_ctx: ctx as u32,
                n_threads,
                n_batch: DEFAULT_BATCH.min(ctx as u32),
            },
        })
    }

    pub fn format(&self) -> ChatFormat {
        self.format
    }

    fn loaded(&self) -> Result<Loaded, GenerateError> {
        {
            let state = self
                .state
                .read()
                .map_err(|e| GenerateError::Runtime(format!("lock poisoned: {}", e)))?;
            match &*state {
                LoadState::Ready(l) => return Ok(l.clone()),
                LoadState::Failed(e) => return Err(GenerateError::NotLoaded(e.clone())),
                LoadState::Loading(_) => {}
            }
        }

        let mut state = self
            .state
            .write()
            .map_err(|e| GenerateError::Runtime(format!("lock poisoned: {}", e)))?;
        let old = std::mem::replace(&mut *state, LoadState::Failed("loading".to_string()));
        let result = match old {
            LoadState::Ready(l) => Ok(l),
            LoadState::Failed(e) => Err(e),
            LoadState::Loading(handle) => match handle.join() {
                Ok(r) => r,
                Err(_) => Err("model loader thread panicked".to_string()),
            },
        };
        match result {
            Ok(l) => {
                *state = LoadState::Ready(l.clone());
                Ok(l)
            }
            Err(e) => {
                *state = LoadState::Failed(e.clone());
                Err(GenerateError::NotLoaded(e))
            }
        }
    }
}

fn load_model_sync(model_path: &Path, gpu_layers: u32) -> Result<Loaded, String> {
    let backend =
        LlamaBackend::init().map_err(|e| format!("Failed to initialize llama.cpp: {}", e))?;
    let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(&backend, model_path, &params)
        .map_err(|e| format!("Failed to load model: {}", e))?;
    tracing::info!(path = %model_path.display(), "model loaded");
    Ok(Loaded {
        backend: Arc::new(backend),
        model: Arc::new(model),
    })
}

/// Buffer bytes until they form complete UTF-8 and return what is ready.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

/// Decode loop. `sink` receives text pieces and returns `false` to stop.
fn generate(
    loaded: &Loaded,
    run: RunConfig,
    format: ChatFormat,
    prompt: &str,
    params: &GenParams,
    sink: &mut dyn FnMut(String) -> bool,
) -> Result<(), GenerateError> {
    let model = loaded.model.as_ref();
    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| GenerateError::Runtime(format!("Tokenization failed: {}", e)))?;

    let requested = tokens.len() + params.max_tokens;
    if requested > run.n_ctx as usize {
        return Err(GenerateError::ContextOverflow(format!(
            "Requested tokens ({}) exceed context window of {}",
            requested, run.n_ctx
        )));
    }

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(run.n_ctx))
        .with_n_batch(run.n_batch)
        .with_n_threads(run.n_threads)
        .with_n_threads_batch(run.n_threads);
    let mut ctx = model
        .new_context(&loaded.backend, ctx_params)
        .map_err(|e| GenerateError::Runtime(format!("Failed to create context: {}", e)))?;

    let mut batch = LlamaBatch::new(run.n_batch as usize, 1);
    let last = tokens.len().saturating_sub(1);
    for (chunk_idx, chunk) in tokens.chunks(run.n_batch as usize).enumerate() {
        batch.clear();
        for (i, token) in chunk.iter().enumerate() {
            let pos = chunk_idx * run.n_batch as usize + i;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| GenerateError::Runtime(format!("Failed to add token: {}", e)))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| GenerateError::Runtime(format!("Decode failed: {}", e)))?;
    }

    let mut sampler = if params.temperature > 0.0 {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::top_p(TOP_P, 1),
            LlamaSampler::top_k(TOP_K),
            LlamaSampler::dist(SEED),
        ])
    } else {
        LlamaSampler::greedy()
    };

    let eos = model.token_eos();
    let markers = format.stop_markers();
    let mut pending: Vec<u8> = Vec::new();
    let mut held = String::new();
    let mut pos = tokens.len() as i32;

    for _ in 0..params.max_tokens {
        let token = sampler.sample(&ctx, -1);
        if token == eos {
            break;
        }
        sampler.accept(token);

        let bytes = model
            .token_to_bytes(token, Special::Plaintext)
            .map_err(|e| GenerateError::Runtime(format!("Failed to decode token: {}", e)))?;
        pending.extend_from_slice(&bytes);
        let piece = take_utf8(&mut pending);
        if !piece.is_empty() {
            held.push_str(&piece);
            let (cut, stop) = marker_cut(&held, markers);
            if cut > 0 && !sink(held[..cut].to_string()) {
                return Ok(());
            }
            if stop {
                return Ok(());
            }
            held.drain(..cut);
        }

        batch.clear();
        batch
            .add(token, pos, &[0], true)
            .map_err(|e| GenerateError::Runtime(format!("Failed to add token: {}", e)))?;
        ctx.decode(&mut batch)
            .map_err(|e| GenerateError::Runtime(format!("Decode failed: {}", e)))?;
        pos += 1;
    }

    held.push_str(&String::from_utf8_lossy(&pending));
    if !held.is_empty() {
        sink(held);
    }
    Ok(())
}

/// How much of `buf` can be emitted, and whether a stop marker begins
/// there. A suffix that could start a marker is held back.
fn marker_cut(buf: &str, markers: &[&str]) -> (usize, bool) {
    if let Some(cut) = markers.iter().filter_map(|m| buf.find(m)).min() {
        return (cut, true);
    }
    let partial = markers
        .iter()
        .filter_map(|m| (1..m.len()).rev().find(|&n| buf.ends_with(&m[..n])))
        .max()
        .unwrap_or(0);
    (buf.len() - partial, false)
}

impl Generator for LlamaGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn context_size(&self) -> usize {
        self.run.n_ctx as usize
    }

    fn count_tokens(&self, text: &str) -> usize {
        match self.loaded() {
            Ok(l) => l
                .model
                .str_to_token(text, AddBos::Never)
                .map(|t| t.len())
                .unwrap_or_else(|_| super::estimate_tokens(text)),
            Err(_) => super::estimate_tokens(text),
        }
    }

    fn chat(&self, messages: &[ChatMessage], params: &GenParams) -> Result<String, GenerateError> {
        let loaded = self.loaded()?;
        let prompt = self.format.render(messages);
        let mut out = String::new();
        generate(&loaded, self.run, self.format, &prompt, params, &mut |piece: String| {
            out.push_str(&piece);
            true
        })?;
        Ok(out.trim().to_string())
    }

    fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenParams,
    ) -> Result<ChatStream, GenerateError> {
        let loaded = self.loaded()?;
        let prompt = self.format.render(messages);
        let (run, format, params) = (self.run, self.format, *params);
        let (tx, rx) = sync_channel::<Result<ChatChunk, GenerateError>>(STREAM_BUFFER);

        std::thread::Builder::new()
            .name("generator-stream".to_string())
            .spawn(move || {
                let mut sink = |piece: String| tx.send(Ok(ChatChunk::delta(piece))).is_ok();
                if let Err(e) = generate(&loaded, run, format, &prompt, &params, &mut sink) {
                    let _ = tx.send(Err(e));
                }
            })
            .map_err(|e| GenerateError::Runtime(format!("cannot spawn stream worker: {}", e)))?;

        Ok(Box::new(ReceiverStream { rx }))
    }
}

struct ReceiverStream {
    rx: Receiver<Result<ChatChunk, GenerateError>>,
}

impl Iterator for ReceiverStream {
    type Item = Result<ChatChunk, GenerateError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_buffers_partial_sequences() {
        let bytes = "ñ".as_bytes();
        let mut pending = vec![b'a', bytes[0]];
        assert_eq!(take_utf8(&mut pending), "a");
        assert_eq!(pending, vec![bytes[0]]);
        pending.push(bytes[1]);
        assert_eq!(take_utf8(&mut pending), "ñ");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_marker_split_across_pieces_is_held_back() {
        let markers = ["<|im_end|>", "<|im_start|>"];
        assert_eq!(marker_cut("Tres meses.<|im", &markers), (11, false));
        assert_eq!(marker_cut("<|im_end|>", &markers), (0, true));
        assert_eq!(marker_cut("Tres meses.<|im_end|>\nuser", &markers), (11, true));
        assert_eq!(marker_cut("a < b", &markers), (5, false));
        assert_eq!(marker_cut("a <", &markers), (2, false));
    }

    #[test]
    fn test_missing_model_file() {
        let err = LlamaGenerator::load(Path::new("/nonexistent/model.gguf"), 2048, None).unwrap_err();
        assert!(matches!(err, GenerateError::NotLoaded(_)));
    }
}
