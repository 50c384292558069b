//! Ordered fallback chains.
//!
//! A [`FallbackChain`] holds [`Strategy`]s in priority order and returns the
//! first success.  Failures are logged at `warn` and never propagate, so
//! callers only have to handle "nothing worked".
//!
//! ```text
//! attempt(src) ─▶ strategy 1 ──Err──▶ strategy 2 ──Err──▶ … ──Err──▶ None
//!                    │                   │
//!                    Ok                  Ok
//!                    ▼                   ▼
//!              Some((name, T))     Some((name, T))
//! ```

use async_trait::async_trait;

use crate::audio::AudioError;

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// One way of turning a source locator into a `T`.
#[async_trait]
pub trait Strategy<T>: Send + Sync {
    /// Short label used in logs and outcomes (`"graph"`, `"element"`, …).
    fn name(&self) -> &'static str;

    async fn attempt(&self, src: &str) -> Result<T, AudioError>;
}

// ---------------------------------------------------------------------------
// FallbackChain
// ---------------------------------------------------------------------------

pub struct FallbackChain<T> {
    strategies: Vec<Box<dyn Strategy<T>>>,
}

impl<T: Send> FallbackChain<T> {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Append a strategy (tried after every one already added).
    pub fn then(mut self, strategy: impl Strategy<T> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order; return the first success with its name.
    pub async fn run(&self, src: &str) -> Option<(&'static str, T)> {
        for strategy in &self.strategies {
            match strategy.attempt(src).await {
                Ok(value) => {
                    log::debug!("fallback: `{src}` via {}", strategy.name());
                    return Some((strategy.name(), value));
                }
                Err(e) => {
                    log::warn!("fallback: {} failed for `{src}`: {e}", strategy.name());
                }
            }
        }
        None
    }
}

impl<T: Send> Default for FallbackChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
