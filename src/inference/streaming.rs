//! Streaming inference support
//!
//! Handles token-by-token delivery of generated text to a consumer.

use std::sync::mpsc::Sender;

use crate::error::SessionError;
use crate::inference::session::GenerationResult;

/// A unit of generated text and its position in the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Zero-based ordinal within one generation
    pub index: usize,
    /// Decoded text fragment
    pub text: String,
}

/// Receives generated tokens.
///
/// `deliver` runs synchronously on the generation worker, once per token and
/// in generation order. A sink that blocks stalls generation; applying
/// backpressure is up to the consumer.
///
/// A sink belongs to exactly one generation. It is moved into the generation
/// call, so it cannot be swapped while tokens are flowing.
pub trait TokenSink: Send {
    fn deliver(&mut self, token: Token);

    /// Called once after the last `deliver`, with the outcome of the generation.
    fn finish(&mut self, _outcome: &Result<GenerationResult, SessionError>) {}
}

impl<F> TokenSink for F
where
    F: FnMut(Token) + Send,
{
    fn deliver(&mut self, token: Token) {
        self(token)
    }
}

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated token string
    Token(String),
    /// Generation completed (normally or cancelled)
    Done,
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Sink that forwards tokens to a channel, terminated by `Done` or `Error`.
///
/// A dropped receiver is not an error: the remaining tokens are discarded.
pub struct ChannelSink {
    tx: Sender<StreamToken>,
}

impl ChannelSink {
    pub fn new(tx: Sender<StreamToken>) -> Self {
        Self { tx }
    }
}

impl TokenSink for ChannelSink {
    fn deliver(&mut self, token: Token) {
        let _ = self.tx.send(StreamToken::Token(token.text));
    }

    fn finish(&mut self, outcome: &Result<GenerationResult, SessionError>) {
        let message = match outcome {
            Ok(_) => StreamToken::Done,
            Err(e) => StreamToken::Error(e.to_string()),
        };
        let _ = self.tx.send(message);
    }
}

/// Reassembles UTF-8 text from raw token bytes.
///
/// Native tokens can split a multi-byte character; the incomplete tail is held
/// back until the following bytes complete it.
#[derive(Debug, Default)]
pub struct PieceDecoder {
    pending: Vec<u8>,
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns the longest complete text available, if any
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Bytes that can never become valid: flush everything lossily.
            Err(e) if e.error_len().is_some() => return self.finish(),
            Err(e) => e.valid_up_to(),
        };

        if valid_up_to == 0 {
            return None;
        }

        let rest = self.pending.split_off(valid_up_to);
        let complete = std::mem::replace(&mut self.pending, rest);
        non_empty(String::from_utf8_lossy(&complete).into_owned())
    }

    /// Flushes whatever is buffered, replacing incomplete sequences
    pub fn finish(&mut self) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        non_empty(String::from_utf8_lossy(&pending).into_owned())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
