//! Page-driven trigger evaluation with a per-session fired-set.
//!
//! The scheduler decides *what* should fire; it never touches audio.  The
//! session turns each [`Firing`] into a cue change or a one-shot.

use std::collections::HashSet;

use crate::chapter::{Chapter, FireAt, PageList, Trigger, TriggerKind};

/// An action produced by trigger evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firing {
    Cue { src: String, looping: bool },
    Sfx { src: String },
}

#[derive(Debug, Default)]
pub struct TriggerScheduler {
    fired: HashSet<String>,
    last_page: Option<usize>,
    /// Page on screen when evaluation was deferred because audio was not
    /// running yet.
    pending: Option<usize>,
}

impl TriggerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a visible-page change.
    ///
    /// Only forward moves (or the first visit) are evaluated, and only while
    /// audio is `running`.  A forward page seen while not running is kept
    /// for [`catch_up`](Self::catch_up); stepping back before the catch-up
    /// moves the deferred evaluation to the page now on screen.
    pub fn on_page(
        &mut self,
        chapter: &Chapter,
        pages: &PageList,
        index: usize,
        running: bool,
    ) -> Vec<Firing> {
        let forward = self.last_page.map_or(true, |last| index > last);
        self.last_page = Some(index);

        if !forward {
            if self.pending.is_some() {
                self.pending = Some(index);
            }
            log::debug!("scheduler: page {index} is not a forward move, skipping");
            return Vec::new();
        }
        if !running {
            log::debug!("scheduler: audio not running, deferring page {index}");
            self.pending = Some(index);
            return Vec::new();
        }
        self.pending = None;
        self.evaluate(chapter, pages, index)
    }

    /// Evaluate the page deferred while audio was not running.
    pub fn catch_up(&mut self, chapter: &Chapter, pages: &PageList) -> Vec<Firing> {
        match self.pending.take() {
            Some(index) => self.evaluate(chapter, pages, index),
            None => Vec::new(),
        }
    }

    /// Claim the lowest-threshold progress cue so ambience can start as
    /// soon as audio is allowed, wherever the reader opened the chapter.
    pub fn start_ambience(&mut self, chapter: &Chapter) -> Option<Firing> {
        let trigger = chapter
            .triggers()
            .iter()
            .filter(|t| t.kind == TriggerKind::Cue)
            .filter(|t| !self.fired.contains(&t.key()))
            .filter_map(|t| t.progress_threshold().map(|th| (th, t)))
            // first of equal thresholds wins
            .fold(None::<(f32, &Trigger)>, |best, (th, t)| match best {
                Some((b, _)) if b <= th => best,
                _ => Some((th, t)),
            })
            .map(|(_, t)| t)?;

        self.fired.insert(trigger.key());
        log::debug!("scheduler: ambience `{}`", trigger.src);
        Some(Firing::Cue {
            src: trigger.src.clone(),
            looping: trigger.looping,
        })
    }

    fn evaluate(&mut self, chapter: &Chapter, pages: &PageList, index: usize) -> Vec<Firing> {
        let progress = pages.progress(index);
        let page = pages.get(index);
        let mut firings = Vec::new();

        for trigger in chapter.triggers() {
            let firing = match trigger.kind {
                TriggerKind::Cue => Firing::Cue {
                    src: trigger.src.clone(),
                    looping: trigger.looping,
                },
                TriggerKind::Sfx => Firing::Sfx {
                    src: trigger.src.clone(),
                },
                // tap-only
                TriggerKind::Voice => continue,
            };
            let key = trigger.key();
            if self.fired.contains(&key) {
                continue;
            }

            let due = match &trigger.at {
                FireAt::Progress(threshold) => progress >= *threshold,
                FireAt::Paragraph(id) | FireAt::Dialogue(id) => {
                    page.is_some_and(|p| p.contains(id))
                }
            };
            if !due {
                continue;
            }

            log::debug!(
                "scheduler: page {index} fires {} `{}` ({})",
                trigger.kind.as_str(),
                trigger.src,
                trigger.at
            );
            self.fired.insert(key);
            firings.push(firing);
        }
        firings
    }

    pub fn fired_count(&self) -> usize {
        self.fired.len()
    }

    pub fn has_fired(&self, key: &str) -> bool {
        self.fired.contains(key)
    }

    pub fn last_page(&self) -> Option<usize> {
        self.last_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(json: &str) -> Chapter {
        Chapter::from_json(json).unwrap()
    }

    fn pages(ids: &[&[&str]]) -> PageList {
        PageList::new(
            ids.iter()
                .map(|p| p.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    fn sfx(src: &str) -> Firing {
        Firing::Sfx { src: src.into() }
    }

    fn cue(src: &str) -> Firing {
        Firing::Cue {
            src: src.into(),
            looping: true,
        }
    }

    #[test]
    fn block_trigger_fires_once_going_forward() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "sfx", "at": "para:b", "src": "door.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"], &["c"]]);
        let mut s = TriggerScheduler::new();

        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        assert_eq!(s.on_page(&ch, &pg, 1, true), vec![sfx("door.ogg")]);
        assert!(s.on_page(&ch, &pg, 2, true).is_empty());
        assert!(s.on_page(&ch, &pg, 1, true).is_empty());
        assert_eq!(s.fired_count(), 1);
    }

    #[test]
    fn backward_move_does_not_evaluate() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "sfx", "at": "para:a", "src": "a.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"]]);
        let mut s = TriggerScheduler::new();

        // open on page 1, then step back to page 0
        assert!(s.on_page(&ch, &pg, 1, true).is_empty());
        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        assert_eq!(s.last_page(), Some(0));
        assert!(!s.has_fired("sfx|a.ogg|para:a"));
    }

    #[test]
    fn progress_fires_at_threshold() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "cue", "at": "progress:0.5", "src": "mid.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"], &["c"], &["d"]]);
        let mut s = TriggerScheduler::new();

        // 0.25 < 0.5
        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        // 0.5 >= 0.5
        assert_eq!(s.on_page(&ch, &pg, 1, true), vec![cue("mid.ogg")]);
        assert!(s.on_page(&ch, &pg, 2, true).is_empty());
    }

    #[test]
    fn skipped_page_crosses_threshold() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "cue", "at": "progress:0.5", "src": "mid.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"], &["c"], &["d"]]);
        let mut s = TriggerScheduler::new();
        s.on_page(&ch, &pg, 0, true);
        assert_eq!(s.on_page(&ch, &pg, 3, true), vec![cue("mid.ogg")]);
    }

    #[test]
    fn voice_triggers_are_never_auto_fired() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "voice", "at": "dialogue:d1", "src": "line.ogg" } ] }"#,
        );
        let pg = pages(&[&["d1"]]);
        let mut s = TriggerScheduler::new();
        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        assert_eq!(s.fired_count(), 0);
    }

    #[test]
    fn triggers_keep_document_order() {
        let ch = chapter(
            r#"{ "triggers": [
                { "kind": "sfx", "at": "para:a", "src": "first.ogg" },
                { "kind": "cue", "at": "progress:0", "src": "bed.ogg" },
                { "kind": "sfx", "at": "para:a", "src": "second.ogg" }
            ] }"#,
        );
        let pg = pages(&[&["a"]]);
        let mut s = TriggerScheduler::new();
        assert_eq!(
            s.on_page(&ch, &pg, 0, true),
            vec![sfx("first.ogg"), cue("bed.ogg"), sfx("second.ogg")]
        );
    }

    #[test]
    fn not_running_defers_until_catch_up() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "sfx", "at": "para:b", "src": "b.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"]]);
        let mut s = TriggerScheduler::new();

        assert!(s.on_page(&ch, &pg, 0, false).is_empty());
        assert!(s.on_page(&ch, &pg, 1, false).is_empty());
        assert_eq!(s.fired_count(), 0);

        assert_eq!(s.catch_up(&ch, &pg), vec![sfx("b.ogg")]);
        assert!(s.catch_up(&ch, &pg).is_empty());
        // page 1 is already the last page: no second evaluation
        assert!(s.on_page(&ch, &pg, 1, true).is_empty());
    }

    #[test]
    fn catch_up_uses_the_page_on_screen_after_stepping_back() {
        let ch = chapter(
            r#"{ "triggers": [
                { "kind": "sfx", "at": "para:b", "src": "near.ogg" },
                { "kind": "sfx", "at": "para:d", "src": "far.ogg" },
                { "kind": "cue", "at": "progress:1.0", "src": "finale.ogg" }
            ] }"#,
        );
        let pg = pages(&[&["a"], &["b"], &["c"], &["d"]]);
        let mut s = TriggerScheduler::new();

        s.on_page(&ch, &pg, 0, false);
        s.on_page(&ch, &pg, 3, false);
        s.on_page(&ch, &pg, 1, false);

        assert_eq!(s.catch_up(&ch, &pg), vec![sfx("near.ogg")]);
        assert!(!s.has_fired("sfx|far.ogg|para:d"));
        assert!(!s.has_fired("cue|finale.ogg|progress:1"));
    }

    #[test]
    fn backward_move_without_deferral_stays_quiet() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "sfx", "at": "para:a", "src": "a.ogg" } ] }"#,
        );
        let pg = pages(&[&["a"], &["b"]]);
        let mut s = TriggerScheduler::new();
        s.on_page(&ch, &pg, 1, true);
        s.on_page(&ch, &pg, 0, false);
        assert!(s.catch_up(&ch, &pg).is_empty());
    }

    #[test]
    fn ambience_is_the_lowest_progress_cue() {
        let ch = chapter(
            r#"{ "triggers": [
                { "kind": "cue", "at": "progress:0.6", "src": "late.ogg" },
                { "kind": "sfx", "at": "progress:0", "src": "sting.ogg" },
                { "kind": "cue", "at": "progress:0.1", "src": "early.ogg" },
                { "kind": "cue", "at": "progress:0.1", "src": "other.ogg" }
            ] }"#,
        );
        let mut s = TriggerScheduler::new();
        assert_eq!(s.start_ambience(&ch), Some(cue("early.ogg")));
        assert!(s.has_fired("cue|early.ogg|progress:0.1"));

        // claimed: later evaluation does not fire it again
        let pg = pages(&[&["a"]]);
        let fired = s.on_page(&ch, &pg, 0, true);
        assert!(!fired.contains(&cue("early.ogg")));
        assert!(fired.contains(&cue("late.ogg")));
    }

    #[test]
    fn no_progress_cue_means_no_ambience() {
        let ch = chapter(
            r#"{ "triggers": [ { "kind": "cue", "at": "para:a", "src": "a.ogg" } ] }"#,
        );
        assert_eq!(TriggerScheduler::new().start_ambience(&ch), None);
    }

    #[test]
    fn two_page_scenario() {
        let ch = chapter(
            r#"{ "triggers": [
                { "kind": "cue", "at": "progress:0.0", "src": "A" },
                { "kind": "sfx", "at": "para:p2", "src": "B" }
            ] }"#,
        );
        let pg = pages(&[&["p1"], &["p2"]]);
        let mut s = TriggerScheduler::new();

        assert_eq!(s.start_ambience(&ch), Some(cue("A")));
        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        assert_eq!(s.on_page(&ch, &pg, 1, true), vec![sfx("B")]);
        assert!(s.on_page(&ch, &pg, 0, true).is_empty());
        assert!(s.on_page(&ch, &pg, 1, true).is_empty());
    }

    #[test]
    fn explicit_ids_deduplicate_across_sources() {
        let ch = chapter(
            r#"{ "triggers": [
                { "kind": "sfx", "id": "knock", "at": "para:a", "src": "knock1.ogg" },
                { "kind": "sfx", "id": "knock", "at": "para:b", "src": "knock2.ogg" }
            ] }"#,
        );
        let pg = pages(&[&["a"], &["b"]]);
        let mut s = TriggerScheduler::new();
        assert_eq!(s.on_page(&ch, &pg, 0, true), vec![sfx("knock1.ogg")]);
        assert!(s.on_page(&ch, &pg, 1, true).is_empty());
    }
}
