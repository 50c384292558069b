//! Chapter AST: content blocks, triggers and their JSON parsing.
//!
//! A chapter arrives as `{ "blocks": [...], "triggers": [...] }`.  Blocks are
//! parsed strictly (their ids define pages, so a bad block is a hard error).
//! Triggers are parsed leniently: each entry is validated on its own and a
//! malformed one is logged and dropped without affecting the rest.
//!
//! ```text
//! "progress:0.25"   → FireAt::Progress(0.25)
//! "para:p7"         → FireAt::Paragraph("p7")
//! "dialogue:d3"     → FireAt::Dialogue("d3")
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ChapterError
// ---------------------------------------------------------------------------

/// Errors that make a chapter document unusable.
#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("invalid chapter JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate block id `{0}`")]
    DuplicateBlockId(String),

    #[error("block at position {0} has an empty id")]
    EmptyBlockId(usize),

    #[error("failed to read chapter file: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// One unit of chapter content, in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    #[serde(alias = "para")]
    Narration {
        id: String,
        #[serde(default)]
        text: String,
    },
    Dialogue {
        id: String,
        #[serde(default)]
        speaker: String,
        #[serde(default)]
        text: String,
        /// Voice-line locator played when the reader taps this block.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
    },
}

impl Block {
    pub fn id(&self) -> &str {
        match self {
            Block::Narration { id, .. } | Block::Dialogue { id, .. } => id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Block::Narration { text, .. } | Block::Dialogue { text, .. } => text,
        }
    }

    /// The block's own voice reference, if it is a voiced dialogue line.
    pub fn voice(&self) -> Option<&str> {
        match self {
            Block::Dialogue { voice, .. } => voice.as_deref().filter(|v| !v.is_empty()),
            Block::Narration { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerKind / FireAt
// ---------------------------------------------------------------------------

/// What a trigger does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// Looping background music.
    Cue,
    /// One-shot sound effect.
    Sfx,
    /// Narrated line, only ever played from a reader tap.
    Voice,
}

impl TriggerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cue" => Some(TriggerKind::Cue),
            "sfx" => Some(TriggerKind::Sfx),
            "voice" => Some(TriggerKind::Voice),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Cue => "cue",
            TriggerKind::Sfx => "sfx",
            TriggerKind::Voice => "voice",
        }
    }
}

/// Firing condition of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum FireAt {
    /// Fraction of the chapter read, `0.0..=1.0`.
    Progress(f32),
    /// A narration block becomes visible.
    Paragraph(String),
    /// A dialogue block becomes visible.
    Dialogue(String),
}

impl FireAt {
    /// Parse `progress:<f>`, `para:<id>` or `dialogue:<id>`.
    ///
    /// ```
    /// use tale_audio::chapter::FireAt;
    ///
    /// assert_eq!(FireAt::parse("progress:0.5"), Some(FireAt::Progress(0.5)));
    /// assert_eq!(FireAt::parse("para:p2"), Some(FireAt::Paragraph("p2".into())));
    /// assert_eq!(FireAt::parse("progress:1.5"), None);
    /// assert_eq!(FireAt::parse("page:3"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, rest) = s.trim().split_once(':')?;
        let rest = rest.trim();
        match prefix.trim().to_ascii_lowercase().as_str() {
            "progress" => {
                let t: f32 = rest.parse().ok()?;
                (t.is_finite() && (0.0..=1.0).contains(&t)).then_some(FireAt::Progress(t))
            }
            "para" if !rest.is_empty() => Some(FireAt::Paragraph(rest.to_string())),
            "dialogue" if !rest.is_empty() => Some(FireAt::Dialogue(rest.to_string())),
            _ => None,
        }
    }

    /// The block id this condition waits for, if it is a visibility condition.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            FireAt::Progress(_) => None,
            FireAt::Paragraph(id) | FireAt::Dialogue(id) => Some(id),
        }
    }
}

impl fmt::Display for FireAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FireAt::Progress(t) => write!(f, "progress:{t}"),
            FireAt::Paragraph(id) => write!(f, "para:{id}"),
            FireAt::Dialogue(id) => write!(f, "dialogue:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// A validated trigger record.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub id: Option<String>,
    pub at: FireAt,
    pub src: String,
    pub looping: bool,
}

impl Trigger {
    /// De-duplication key: the explicit id, or `kind|src|at`.
    pub fn key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}|{}|{}", self.kind.as_str(), self.src, self.at),
        }
    }

    pub fn progress_threshold(&self) -> Option<f32> {
        match self.at {
            FireAt::Progress(t) => Some(t),
            _ => None,
        }
    }
}

/// Trigger as it appears on the wire; every field optional so one bad entry
/// cannot fail the whole document.
#[derive(Debug, Default, Deserialize)]
struct RawTrigger {
    kind: Option<String>,
    id: Option<String>,
    at: Option<String>,
    src: Option<String>,
    #[serde(rename = "loop")]
    looping: Option<bool>,
}

impl RawTrigger {
    fn validate(self) -> Result<Trigger, String> {
        let kind_str = self.kind.ok_or("missing `kind`")?;
        let kind =
            TriggerKind::parse(&kind_str).ok_or_else(|| format!("unknown kind `{kind_str}`"))?;
        let at_str = self.at.ok_or("missing `at`")?;
        let at = FireAt::parse(&at_str).ok_or_else(|| format!("unparseable `at` `{at_str}`"))?;
        let src = self
            .src
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or("missing `src`")?;

        Ok(Trigger {
            kind,
            id: self.id.filter(|id| !id.is_empty()),
            at,
            src,
            looping: self.looping.unwrap_or(kind == TriggerKind::Cue),
        })
    }
}

// ---------------------------------------------------------------------------
// Chapter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawChapter {
    #[serde(default)]
    blocks: Vec<Block>,
    #[serde(default)]
    triggers: Vec<serde_json::Value>,
}

/// Immutable chapter content for one reading session.
#[derive(Debug, Clone, Default)]
pub struct Chapter {
    blocks: Vec<Block>,
    triggers: Vec<Trigger>,
}

impl Chapter {
    /// Build a chapter from already-validated parts.
    pub fn new(blocks: Vec<Block>, triggers: Vec<Trigger>) -> Result<Self, ChapterError> {
        let mut seen = HashSet::new();
        for (pos, block) in blocks.iter().enumerate() {
            if block.id().is_empty() {
                return Err(ChapterError::EmptyBlockId(pos));
            }
            if !seen.insert(block.id()) {
                return Err(ChapterError::DuplicateBlockId(block.id().to_string()));
            }
        }
        Ok(Self { blocks, triggers })
    }

    /// Parse a chapter JSON document.
    pub fn from_json(json: &str) -> Result<Self, ChapterError> {
        let raw: RawChapter = serde_json::from_str(json)?;

        let mut triggers = Vec::with_capacity(raw.triggers.len());
        for (pos, value) in raw.triggers.into_iter().enumerate() {
            let parsed = serde_json::from_value::<RawTrigger>(value)
                .map_err(|e| e.to_string())
                .and_then(RawTrigger::validate);
            match parsed {
                Ok(trigger) => triggers.push(trigger),
                Err(reason) => log::warn!("chapter: skipping trigger #{pos}: {reason}"),
            }
        }

        Self::new(raw.blocks, triggers)
    }

    /// Read and parse a chapter file.
    pub fn load(path: &std::path::Path) -> Result<Self, ChapterError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Small built-in chapter used when no content could be loaded.
    pub fn sample() -> Self {
        const SAMPLE: &str = r#"{
            "blocks": [
                { "type": "narration", "id": "p1", "text": "The lighthouse had been dark for eleven winters." },
                { "type": "narration", "id": "p2", "text": "Wind worried at the shutters as Mara climbed." },
                { "type": "dialogue", "id": "d1", "speaker": "Mara", "text": "Is anyone up there?", "voice": "tone:test" },
                { "type": "narration", "id": "p3", "text": "Above her, something answered with a slow, turning light." }
            ],
            "triggers": [
                { "kind": "cue", "at": "progress:0.0", "src": "audio/harbor-night.ogg" },
                { "kind": "sfx", "at": "para:p2", "src": "audio/wind-gust.ogg" },
                { "kind": "cue", "at": "progress:0.75", "src": "audio/lamp-room.ogg" }
            ]
        }"#;
        Self::from_json(SAMPLE).unwrap_or_default()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    /// Voice source to play when the reader taps `block_id`.
    ///
    /// The block's own `voice` reference wins; otherwise the first voice
    /// trigger targeting the block is used.
    pub fn voice_for(&self, block_id: &str) -> Option<&str> {
        if let Some(voice) = self.block(block_id).and_then(Block::voice) {
            return Some(voice);
        }
        self.triggers
            .iter()
            .filter(|t| t.kind == TriggerKind::Voice)
            .find(|t| t.at.block_id() == Some(block_id))
            .map(|t| t.src.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "blocks": [
            { "type": "narration", "id": "p1", "text": "one" },
            { "type": "dialogue", "id": "d1", "speaker": "Ann", "text": "hi", "voice": "v/d1.mp3" },
            { "type": "para", "id": "p2", "text": "two" },
            { "type": "dialogue", "id": "d2", "speaker": "Bo", "text": "yo" }
        ],
        "triggers": [
            { "kind": "cue", "at": "progress:0.0", "src": "A" },
            { "kind": "sfx", "at": "para:p2", "src": "B" },
            { "kind": "voice", "at": "dialogue:d2", "src": "v/d2.mp3" },
            { "kind": "drone", "at": "progress:0.1", "src": "X" },
            { "kind": "sfx", "at": "para:p2" },
            { "kind": "sfx", "at": "somewhere", "src": "Y" },
            { "kind": "cue", "at": "progress:0.5", "src": 42 }
        ]
    }"#;

    #[test]
    fn parses_valid_triggers_and_skips_malformed() {
        let chapter = Chapter::from_json(DOC).unwrap();
        assert_eq!(chapter.blocks().len(), 4);
        assert_eq!(chapter.triggers().len(), 3);
        assert_eq!(chapter.triggers()[0].kind, TriggerKind::Cue);
        assert_eq!(chapter.triggers()[1].at, FireAt::Paragraph("p2".into()));
        assert_eq!(chapter.triggers()[2].kind, TriggerKind::Voice);
    }

    #[test]
    fn loop_defaults_true_for_cues_only() {
        let chapter = Chapter::from_json(DOC).unwrap();
        assert!(chapter.triggers()[0].looping);
        assert!(!chapter.triggers()[1].looping);
    }

    #[test]
    fn explicit_loop_false_is_respected() {
        let json = r#"{ "blocks": [], "triggers": [
            { "kind": "cue", "at": "progress:0", "src": "A", "loop": false }
        ] }"#;
        let chapter = Chapter::from_json(json).unwrap();
        assert!(!chapter.triggers()[0].looping);
    }

    #[test]
    fn synthetic_key_uses_kind_src_and_at() {
        let chapter = Chapter::from_json(DOC).unwrap();
        assert_eq!(chapter.triggers()[1].key(), "sfx|B|para:p2");
    }

    #[test]
    fn explicit_id_is_the_key() {
        let json = r#"{ "triggers": [
            { "kind": "sfx", "id": "thunder-1", "at": "para:p1", "src": "T" }
        ] }"#;
        let chapter = Chapter::from_json(json).unwrap();
        assert_eq!(chapter.triggers()[0].key(), "thunder-1");
    }

    #[test]
    fn duplicate_block_ids_are_rejected() {
        let json = r#"{ "blocks": [
            { "type": "narration", "id": "p1" },
            { "type": "narration", "id": "p1" }
        ] }"#;
        assert!(matches!(
            Chapter::from_json(json),
            Err(ChapterError::DuplicateBlockId(id)) if id == "p1"
        ));
    }

    #[test]
    fn empty_block_id_is_rejected() {
        let json = r#"{ "blocks": [ { "type": "narration", "id": "" } ] }"#;
        assert!(matches!(
            Chapter::from_json(json),
            Err(ChapterError::EmptyBlockId(0))
        ));
    }

    #[test]
    fn unknown_block_type_is_a_hard_error() {
        let json = r#"{ "blocks": [ { "type": "image", "id": "i1" } ] }"#;
        assert!(matches!(Chapter::from_json(json), Err(ChapterError::Json(_))));
    }

    #[test]
    fn voice_for_prefers_block_reference() {
        let chapter = Chapter::from_json(DOC).unwrap();
        assert_eq!(chapter.voice_for("d1"), Some("v/d1.mp3"));
        assert_eq!(chapter.voice_for("d2"), Some("v/d2.mp3"));
        assert_eq!(chapter.voice_for("p1"), None);
        assert_eq!(chapter.voice_for("missing"), None);
    }

    #[test]
    fn fire_at_round_trips_through_display() {
        for s in ["progress:0.25", "para:p9", "dialogue:d4"] {
            assert_eq!(FireAt::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn fire_at_rejects_garbage() {
        assert_eq!(FireAt::parse("progress:abc"), None);
        assert_eq!(FireAt::parse("progress:-0.1"), None);
        assert_eq!(FireAt::parse("para:"), None);
        assert_eq!(FireAt::parse("noprefix"), None);
    }

    #[test]
    fn sample_chapter_is_well_formed() {
        let chapter = Chapter::sample();
        assert_eq!(chapter.blocks().len(), 4);
        assert_eq!(chapter.triggers().len(), 3);
    }
}
