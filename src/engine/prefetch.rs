//! Decode-cache warming on page changes.
//!
//! Purely a latency optimisation: the prefetcher fills [`AudioGraph`]'s
//! decode cache and never starts playback.  Skipped candidates are simply
//! decoded on first use instead.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::graph::AudioGraph;
use super::voice::TEST_TONE_SRC;
use crate::chapter::{Chapter, PageList, TriggerKind};
use crate::config::{NetworkHint, PrefetchConfig};

pub struct Prefetcher {
    config: PrefetchConfig,
    network: NetworkHint,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig, network: NetworkHint) -> Self {
        Self { config, network }
    }

    /// Sources allowed per pass under the current network hint.
    pub fn budget(&self) -> usize {
        if !self.config.enabled {
            0
        } else if self.network.is_constrained() {
            self.config.constrained_max_per_pass
        } else {
            self.config.max_per_pass
        }
    }

    pub fn set_network(&mut self, network: NetworkHint) {
        self.network = network;
    }

    /// Sources worth decoding now that page `index` is visible.
    ///
    /// Block-targeted sfx/voice on this page and the next come first, then
    /// dialogue voice references on those pages, then every cue.  Sources
    /// for which `is_cached` holds are dropped before the budget is applied.
    pub fn plan(
        &self,
        chapter: &Chapter,
        pages: &PageList,
        index: usize,
        is_cached: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let budget = self.budget();
        if budget == 0 {
            return Vec::new();
        }

        let window: Vec<_> = [index, index + 1]
            .into_iter()
            .filter_map(|i| pages.get(i))
            .collect();
        let visible = |id: &str| window.iter().any(|p| p.contains(id));

        let nearby = chapter
            .triggers()
            .iter()
            .filter(|t| matches!(t.kind, TriggerKind::Sfx | TriggerKind::Voice))
            .filter(|t| t.at.block_id().is_some_and(visible))
            .map(|t| t.src.as_str());
        let voiced = chapter
            .blocks()
            .iter()
            .filter(|b| visible(b.id()))
            .filter_map(|b| b.voice());
        let cues = chapter
            .triggers()
            .iter()
            .filter(|t| t.kind == TriggerKind::Cue)
            .map(|t| t.src.as_str());

        let mut seen = HashSet::new();
        nearby
            .chain(voiced)
            .chain(cues)
            .filter(|src| *src != TEST_TONE_SRC)
            .filter(|src| seen.insert(*src))
            .filter(|src| !is_cached(src))
            .take(budget)
            .map(str::to_string)
            .collect()
    }

    /// Start decodes for [`plan`](Self::plan).  Failures are logged and
    /// otherwise ignored.
    pub fn warm(
        &self,
        graph: &Arc<AudioGraph>,
        chapter: &Chapter,
        pages: &PageList,
        index: usize,
    ) -> Vec<JoinHandle<()>> {
        let planned = self.plan(chapter, pages, index, |src| graph.is_cached(src));
        if !planned.is_empty() {
            log::debug!("prefetch: page {index} warming {} source(s)", planned.len());
        }
        planned
            .into_iter()
            .map(|src| {
                let graph = graph.clone();
                tokio::spawn(async move {
                    if let Err(e) = graph.decode(&src).await {
                        log::debug!("prefetch: `{src}` not warmed: {e}");
                    }
                })
            })
            .collect()
    }
}
