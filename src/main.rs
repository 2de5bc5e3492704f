//! genai-session - run a single prompt against a local GGUF model
//!
//! Tokens are streamed to stdout as they are produced. Ctrl-C stops the
//! generation at the next token boundary; the model is always released
//! before the process exits.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use genai_session::config::default_config_path;
use genai_session::inference::params::{MAX_LENGTH, TEMPERATURE};
use genai_session::logging::init_logging;
use genai_session::{ChannelSink, GenerationSession, LlamaEngine, RawParams, SessionConfig, StreamToken};

#[derive(Parser, Debug)]
#[command(name = "genai-session", version, about = "Generate text with a local GGUF model")]
struct Cli {
    /// GGUF model file, or a directory containing one
    model: PathBuf,

    /// Prompt text
    #[arg(short, long)]
    prompt: String,

    /// Sampling temperature
    #[arg(short, long)]
    temperature: Option<f64>,

    /// Maximum number of tokens to generate
    #[arg(short = 'n', long)]
    max_length: Option<f64>,

    /// Extra generation parameter, e.g. `--param top_p=0.9` (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, f64)>,

    /// Config file (defaults to the platform data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Layers to offload to the GPU, overriding the config
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Print the generated text and run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn raw_params(&self) -> RawParams {
        let mut raw: RawParams = self.params.iter().cloned().collect();
        if let Some(temperature) = self.temperature {
            raw.insert(TEMPERATURE.to_string(), temperature);
        }
        if let Some(max_length) = self.max_length {
            raw.insert(MAX_LENGTH.to_string(), max_length);
        }
        raw
    }

    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?,
            None => match default_config_path() {
                Ok(path) => SessionConfig::load_or_default(&path),
                Err(e) => {
                    warn!("No data directory, using default config: {}", e);
                    SessionConfig::default()
                }
            },
        };

        if let Some(gpu_layers) = self.gpu_layers {
            config.gpu_layers = gpu_layers;
        }
        config.validate();
        Ok(config)
    }
}

fn parse_param(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for `{key}`: {e}"))?;
    Ok((key.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging("genai_session=info");

    info!("Starting genai-session v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.session_config()?;
    let raw_params = cli.raw_params();
    let session = Arc::new(GenerationSession::new(LlamaEngine::new(config.clone()), config)?);

    let stopper = Arc::clone(&session);
    tokio::spawn(forward_interrupts(tokio::signal::ctrl_c, move || {
        stopper.stop_generation()
    }));

    let runner = Arc::clone(&session);
    let Cli {
        model, prompt, json, ..
    } = cli;
    let outcome =
        tokio::task::spawn_blocking(move || run(&runner, &model, &prompt, &raw_params, json)).await;

    session.unload();

    outcome.context("Generation task failed")?
}

/// Calls `on_interrupt` for every signal until the source fails.
///
/// Once the Ctrl-C handler is installed SIGINT no longer ends the process, so
/// a signal that arrives while nothing is generating must not end the loop.
async fn forward_interrupts<S, F>(mut next_signal: S, on_interrupt: impl Fn())
where
    S: FnMut() -> F,
    F: Future<Output = io::Result<()>>,
{
    while next_signal().await.is_ok() {
        warn!("Interrupted, stopping generation");
        on_interrupt();
    }
}

fn run(
    session: &GenerationSession,
    model: &Path,
    prompt: &str,
    raw_params: &RawParams,
    json: bool,
) -> anyhow::Result<()> {
    let model_info = session.load(model)?;

    let (tx, rx) = mpsc::channel();
    let handle = session.start_generation(prompt, raw_params, ChannelSink::new(tx))?;
    info!(generation_id = %handle.id(), "Streaming tokens");

    let mut stdout = io::stdout().lock();
    let mut text = String::new();
    for item in rx {
        match item {
            StreamToken::Token(piece) => {
                if !json {
                    write!(stdout, "{piece}")?;
                    stdout.flush()?;
                }
                text.push_str(&piece);
            }
            // The error itself comes back through the handle
            StreamToken::Done | StreamToken::Error(_) => break,
        }
    }

    let result = handle.wait()?;

    if json {
        let summary = serde_json::json!({
            "model": model_info,
            "text": text,
            "result": result,
        });
        writeln!(stdout, "{}", serde_json::to_string_pretty(&summary)?)?;
    } else {
        writeln!(stdout)?;
        info!(
            tokens = result.token_count,
            stop_reason = ?result.stop_reason,
            elapsed_ms = u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Generation finished"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("top_p=0.9").unwrap(), ("top_p".to_string(), 0.9));
        assert_eq!(parse_param(" top_k = 40 ").unwrap(), ("top_k".to_string(), 40.0));
        assert!(parse_param("top_p").is_err());
        assert!(parse_param("top_p=abc").is_err());
    }

    #[test]
    fn test_explicit_flags_override_params() {
        let cli = Cli::parse_from([
            "genai-session",
            "model.gguf",
            "--prompt",
            "hi",
            "--param",
            "temperature=0.2",
            "--param",
            "top_p=0.5",
            "--temperature",
            "0.7",
        ]);

        let raw = cli.raw_params();
        assert_eq!(raw.get(TEMPERATURE), Some(&0.7));
        assert_eq!(raw.get("top_p"), Some(&0.5));
        assert!(!raw.contains_key(MAX_LENGTH));
    }

    #[tokio::test]
    async fn test_every_interrupt_is_forwarded() {
        let mut pending = 3;
        let next_signal = move || {
            let signal = if pending > 0 {
                pending -= 1;
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "signal stream closed"))
            };
            async move { signal }
        };

        let hits = AtomicUsize::new(0);
        forward_interrupts(next_signal, || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
