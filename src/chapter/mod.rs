//! Chapter content consumed by the audio engine.
//!
//! * [`Chapter`]: ordered [`Block`]s plus validated [`Trigger`]s.
//! * [`PageList`] / [`Page`]: block-id membership per screen, produced by
//!   the pagination collaborator.
//!
//! # Quick start
//!
//! ```rust
//! use tale_audio::chapter::{Chapter, PageList};
//!
//! let chapter = Chapter::from_json(r#"{
//!     "blocks": [ { "type": "narration", "id": "p1", "text": "..." } ],
//!     "triggers": [ { "kind": "cue", "at": "progress:0", "src": "music/a.ogg" } ]
//! }"#).unwrap();
//! let pages = PageList::single_blocks(&chapter);
//! assert_eq!(pages.len(), 1);
//! ```

pub mod model;
pub mod page;

pub use model::{Block, Chapter, ChapterError, FireAt, Trigger, TriggerKind};
pub use page::{Page, PageList};
