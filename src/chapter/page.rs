//! Page list supplied by the pagination collaborator.
//!
//! The engine treats a page as nothing more than the set of block ids shown
//! on one screen.  Pagination itself happens elsewhere.

use std::collections::HashSet;

use serde::Deserialize;

use super::model::{Chapter, ChapterError};

/// One screen of content.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub index: usize,
    blocks: HashSet<String>,
}

impl Page {
    pub fn new(index: usize, blocks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            index,
            blocks: blocks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.blocks.contains(block_id)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    blocks: Vec<String>,
}

/// Ordered pages of a chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageList {
    pages: Vec<Page>,
}

impl PageList {
    pub fn new(pages: Vec<Vec<String>>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .enumerate()
                .map(|(i, ids)| Page::new(i, ids))
                .collect(),
        }
    }

    /// Parse `[{ "blocks": ["p1", ...] }, ...]`.
    pub fn from_json(json: &str) -> Result<Self, ChapterError> {
        let raw: Vec<RawPage> = serde_json::from_str(json)?;
        Ok(Self::new(raw.into_iter().map(|p| p.blocks).collect()))
    }

    /// One block per page, in reading order.
    pub fn single_blocks(chapter: &Chapter) -> Self {
        Self::new(
            chapter
                .blocks()
                .iter()
                .map(|b| vec![b.id().to_string()])
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    /// Reading progress after `index` is on screen: `(index + 1) / len`,
    /// clamped to `[0, 1]`.  An empty list reports `0.0`.
    pub fn progress(&self, index: usize) -> f32 {
        if self.pages.is_empty() {
            return 0.0;
        }
        ((index as f32 + 1.0) / self.pages.len() as f32).clamp(0.0, 1.0)
    }
}
