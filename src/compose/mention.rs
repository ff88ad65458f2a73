//! Mention resolver: address an assistant inline with `@name`.

use regex::Regex;
use tracing::{debug, warn};

use super::{ComposerKey, KeyOutcome, clamp_caret, cycle, splice};
use crate::backend::ChatBackend;
use crate::model::{Candidate, CandidateKind};

/// Candidates whose display name contains `query`, case-insensitively.
pub fn filter_candidates(candidates: &[Candidate], query: &str) -> Vec<Candidate> {
    let needle = query.to_lowercase();
    candidates
        .iter()
        .filter(|c| c.matches_lower(&needle, false))
        .cloned()
        .collect()
}

/// Tracks the `@` trigger, the candidate cache, and the keyboard selection.
pub struct MentionResolver {
    trigger: char,
    pattern: Regex,
    active: bool,
    query: String,
    /// Fetched once per activation; dropped on deactivation.
    candidates: Option<Vec<Candidate>>,
    filtered: Vec<Candidate>,
    selected: usize,
    addressee: Option<i64>,
}

impl MentionResolver {
    pub fn new(trigger: char) -> Self {
        let pattern = Regex::new(&format!(r"{}(\w*)$", regex::escape(&trigger.to_string())))
            .expect("escaped trigger is a valid pattern");
        Self {
            trigger,
            pattern,
            active: false,
            query: String::new(),
            candidates: None,
            filtered: Vec::new(),
            selected: 0,
            addressee: None,
        }
    }

    /// The fragment after the trigger, if the text before the caret ends in one.
    pub fn detect(&self, text: &str, caret: usize) -> Option<String> {
        let caret = clamp_caret(text, caret);
        self.pattern
            .captures(&text[..caret])
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Re-run detection after a keystroke. Returns whether the list is open.
    pub async fn on_input(&mut self, backend: &dyn ChatBackend, text: &str, caret: usize) -> bool {
        let Some(query) = self.detect(text, caret) else {
            self.deactivate();
            return false;
        };

        if self.candidates.is_none() {
            let fetched = match backend.search_candidates(CandidateKind::Assistant, "").await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "Mention candidate lookup failed");
                    Vec::new()
                }
            };
            debug!(count = fetched.len(), "Mention candidates loaded");
            self.candidates = Some(fetched);
        }

        if !self.active || query != self.query {
            self.selected = 0;
        }
        self.active = true;
        self.query = query;
        self.refilter();
        true
    }

    /// Use a preloaded candidate list instead of fetching on activation.
    pub fn set_candidates(&mut self, candidates: Vec<Candidate>) {
        self.candidates = Some(candidates);
        self.refilter();
    }

    fn refilter(&mut self) {
        self.filtered = self
            .candidates
            .as_deref()
            .map(|all| filter_candidates(all, &self.query))
            .unwrap_or_default();
        if self.selected >= self.filtered.len() {
            self.selected = 0;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn filtered(&self) -> &[Candidate] {
        &self.filtered
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> Option<&Candidate> {
        self.filtered.get(self.selected)
    }

    pub fn on_key(&mut self, key: ComposerKey, text: &mut String, caret: &mut usize) -> KeyOutcome {
        if !self.active {
            return KeyOutcome::Ignored;
        }
        match key {
            ComposerKey::Up | ComposerKey::Down => match cycle(self.selected, self.filtered.len(), key) {
                Some(index) => {
                    self.selected = index;
                    KeyOutcome::Moved(index)
                }
                None => KeyOutcome::Moved(0),
            },
            ComposerKey::Enter => {
                let Some(candidate) = self.selected().cloned() else {
                    return KeyOutcome::Ignored;
                };
                if self.commit(&candidate, text, caret) {
                    KeyOutcome::Committed(candidate)
                } else {
                    KeyOutcome::Ignored
                }
            }
            ComposerKey::Escape => {
                self.deactivate();
                KeyOutcome::Dismissed
            }
        }
    }

    /// Splice `@<name> ` over the trigger fragment and record the addressee.
    ///
    /// No-op (returns false) when no trigger precedes the caret.
    pub fn commit(&mut self, candidate: &Candidate, text: &mut String, caret: &mut usize) -> bool {
        let end = clamp_caret(text, *caret);
        let Some(start) = text[..end].rfind(self.trigger) else {
            debug!("Mention commit skipped: no trigger before caret");
            return false;
        };

        let replacement = format!("{}{} ", self.trigger, candidate.name);
        *caret = splice(text, start, end, &replacement);
        self.addressee = Some(candidate.id);
        self.deactivate();
        true
    }

    /// Close the list and drop the candidate cache. Keeps the pending addressee.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.query.clear();
        self.candidates = None;
        self.filtered.clear();
        self.selected = 0;
    }

    /// Deactivate and forget the pending addressee.
    pub fn reset(&mut self) {
        self.deactivate();
        self.addressee = None;
    }

    pub fn pending_addressee(&self) -> Option<i64> {
        self.addressee
    }

    pub fn take_addressee(&mut self) -> Option<i64> {
        self.addressee.take()
    }
}
