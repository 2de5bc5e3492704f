//! Generation parameters
//!
//! Turns the loosely-typed `{key: number}` map a caller supplies into a
//! [`GenerationParams`] record. Validation is all-or-nothing: one bad field
//! rejects the whole request.
//!
//! Keys outside [`RECOGNIZED_KEYS`] are ignored, never rejected. Use
//! [`unrecognized_keys`] to find out which ones were skipped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Raw parameter map as received from a caller
pub type RawParams = HashMap<String, f64>;

pub const TEMPERATURE: &str = "temperature";
pub const MAX_LENGTH: &str = "max_length";
pub const TOP_P: &str = "top_p";
pub const TOP_K: &str = "top_k";
pub const REPETITION_PENALTY: &str = "repetition_penalty";

/// Keys the validator understands
pub const RECOGNIZED_KEYS: [&str; 5] = [TEMPERATURE, MAX_LENGTH, TOP_P, TOP_K, REPETITION_PENALTY];

/// Temperature used when the request does not set one
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Validated generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature, always > 0
    pub temperature: f32,
    /// Hard cap on delivered tokens, always >= 1
    pub max_length: u32,
    /// Nucleus sampling threshold in (0, 1]
    pub top_p: Option<f32>,
    /// Top-k sampling, >= 1
    pub top_k: Option<u32>,
    /// Repetition penalty, >= 1
    pub repetition_penalty: Option<f32>,
}

impl GenerationParams {
    /// Serializes back into the raw map form accepted by [`ParameterValidator::validate`]
    pub fn to_raw(&self) -> RawParams {
        let mut raw = RawParams::new();
        raw.insert(TEMPERATURE.to_string(), f64::from(self.temperature));
        raw.insert(MAX_LENGTH.to_string(), f64::from(self.max_length));
        if let Some(top_p) = self.top_p {
            raw.insert(TOP_P.to_string(), f64::from(top_p));
        }
        if let Some(top_k) = self.top_k {
            raw.insert(TOP_K.to_string(), f64::from(top_k));
        }
        if let Some(penalty) = self.repetition_penalty {
            raw.insert(REPETITION_PENALTY.to_string(), f64::from(penalty));
        }
        raw
    }
}

/// Validates raw parameter maps against one model's limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterValidator {
    context_window: u32,
    default_max_length: u32,
}

impl ParameterValidator {
    /// `default_max_length` is capped by `context_window`
    pub fn new(context_window: u32, default_max_length: u32) -> Self {
        let context_window = context_window.max(1);
        Self {
            context_window,
            default_max_length: default_max_length.clamp(1, context_window),
        }
    }

    /// Validates `raw`, filling defaults for absent keys
    ///
    /// # Returns
    /// * `Ok(GenerationParams)` - Every recognized key in its domain
    /// * `Err(ValidationError)` - The first field found out of its domain
    pub fn validate(&self, raw: &RawParams) -> Result<GenerationParams, ValidationError> {
        let temperature = match raw.get(TEMPERATURE) {
            Some(&value) => positive_f32(TEMPERATURE, value)?,
            None => DEFAULT_TEMPERATURE,
        };

        let max_length = match raw.get(MAX_LENGTH) {
            Some(&value) => {
                let max_length = positive_u32(MAX_LENGTH, value)?;
                if max_length > self.context_window {
                    return Err(ValidationError::new(
                        MAX_LENGTH,
                        format!("must not exceed the context window of {}", self.context_window),
                    ));
                }
                max_length
            }
            None => self.default_max_length,
        };

        let top_p = raw
            .get(TOP_P)
            .map(|&value| {
                // Bound checked before narrowing, which would round onto 1.0
                if value > 1.0 {
                    return Err(ValidationError::new(TOP_P, "must be in (0, 1]"));
                }
                positive_f32(TOP_P, value)
            })
            .transpose()?;

        let top_k = raw
            .get(TOP_K)
            .map(|&value| positive_u32(TOP_K, value))
            .transpose()?;

        let repetition_penalty = raw
            .get(REPETITION_PENALTY)
            .map(|&value| {
                if finite(REPETITION_PENALTY, value)? < 1.0 {
                    return Err(ValidationError::new(REPETITION_PENALTY, "must be >= 1"));
                }
                let penalty = value as f32;
                if !penalty.is_finite() {
                    return Err(ValidationError::new(REPETITION_PENALTY, "must be a finite number"));
                }
                Ok(penalty)
            })
            .transpose()?;

        Ok(GenerationParams {
            temperature,
            max_length,
            top_p,
            top_k,
            repetition_penalty,
        })
    }
}

/// Keys in `raw` that [`ParameterValidator::validate`] ignores, sorted
pub fn unrecognized_keys(raw: &RawParams) -> Vec<&str> {
    let mut keys: Vec<&str> = raw
        .keys()
        .map(String::as_str)
        .filter(|key| !RECOGNIZED_KEYS.contains(key))
        .collect();
    keys.sort_unstable();
    keys
}

fn finite(field: &str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::new(field, "must be a finite number"))
    }
}

// Checked after narrowing so a value that rounds to zero in f32 is still rejected.
fn positive_f32(field: &str, value: f64) -> Result<f32, ValidationError> {
    let narrowed = finite(field, value)? as f32;
    if narrowed > 0.0 && narrowed.is_finite() {
        Ok(narrowed)
    } else {
        Err(ValidationError::new(field, "must be > 0"))
    }
}

fn positive_u32(field: &str, value: f64) -> Result<u32, ValidationError> {
    let value = finite(field, value)?;
    if value.fract() != 0.0 {
        return Err(ValidationError::new(field, "must be an integer"));
    }
    if value < 1.0 {
        return Err(ValidationError::new(field, "must be >= 1"));
    }
    if value > f64::from(u32::MAX) {
        return Err(ValidationError::new(field, format!("must be <= {}", u32::MAX)));
    }
    Ok(value as u32)
}
