//! Tag suggestions: reference a backend entity class, then an instance, with
//! `#class/instance`.
//!
//! The phase is derived purely from the query: no `/` means the class phase,
//! a `/` means the instance phase. Remote lookups happen only when a phase is
//! entered; every other keystroke re-filters the cached results locally.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::{ComposerKey, KeyOutcome, clamp_caret, cycle, splice};
use crate::backend::ChatBackend;
use crate::model::Candidate;

/// Which lookup a tag query is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagPhase {
    Class,
    Instance,
}

impl TagPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Instance => "instance",
        }
    }
}

/// How many suggestions the view wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Everything that matches.
    Full,
    /// Sorted short list, capped.
    Short,
}

/// A parsed tag fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    Class(String),
    Instance { class: String, term: String },
}

impl TagQuery {
    /// Split the fragment once on `/`.
    pub fn parse(fragment: &str) -> Self {
        match fragment.split_once('/') {
            Some((class, term)) => Self::Instance {
                class: class.to_string(),
                term: term.to_string(),
            },
            None => Self::Class(fragment.to_string()),
        }
    }

    pub fn phase(&self) -> TagPhase {
        match self {
            Self::Class(_) => TagPhase::Class,
            Self::Instance { .. } => TagPhase::Instance,
        }
    }
}

/// Suggestion list handed to the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagSuggestions {
    pub phase: TagPhase,
    pub items: Vec<Candidate>,
}

/// A committed instance tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagReference {
    pub class: String,
    pub record_id: i64,
    pub name: String,
}

pub struct TagSuggestionResolver {
    trigger: char,
    pattern: Regex,
    short_list_len: usize,
    phase: Option<TagPhase>,
    /// Class named in the instance phase that the instance cache was fetched for.
    instance_class: Option<String>,
    term: String,
    class_cache: Vec<Candidate>,
    instance_cache: HashMap<String, Vec<Candidate>>,
    filtered: Vec<Candidate>,
    selected: usize,
    references: Vec<TagReference>,
}

impl TagSuggestionResolver {
    pub fn new(trigger: char, short_list_len: usize) -> Self {
        let t = regex::escape(&trigger.to_string());
        let pattern = Regex::new(&format!(r"{t}([^\s{t}]*)$"))
            .expect("escaped trigger is a valid pattern");
        Self {
            trigger,
            pattern,
            short_list_len,
            phase: None,
            instance_class: None,
            term: String::new(),
            class_cache: Vec::new(),
            instance_cache: HashMap::new(),
            filtered: Vec::new(),
            selected: 0,
            references: Vec::new(),
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

    /// Re-run detection after a keystroke. Returns the active phase, if any.
    pub async fn on_input(
        &mut self,
        backend: &dyn ChatBackend,
        text: &str,
        caret: usize,
    ) -> Option<TagPhase> {
        let Some(fragment) = self.detect(text, caret) else {
            self.deactivate();
            return None;
        };

        let previous_term = std::mem::take(&mut self.term);
        let query = TagQuery::parse(&fragment);
        match &query {
            TagQuery::Class(term) => {
                if self.phase != Some(TagPhase::Class) {
                    self.class_cache = match backend.search_entity_classes(term).await {
                        Ok(list) => list,
                        Err(e) => {
                            warn!(error = %e, term = %term, "Entity class lookup failed");
                            Vec::new()
                        }
                    };
                    debug!(term = %term, count = self.class_cache.len(), "Class phase entered");
                    self.instance_class = None;
                }
                self.term = term.clone();
            }
            TagQuery::Instance { class, term } => {
                let entering = self.phase != Some(TagPhase::Instance)
                    || self.instance_class.as_deref() != Some(class.as_str());
                if entering {
                    let list = match backend.search_entity_instances(class, term).await {
                        Ok(list) => list,
                        Err(e) => {
                            warn!(error = %e, class = %class, term = %term, "Entity instance lookup failed");
                            Vec::new()
                        }
                    };
                    debug!(class = %class, term = %term, count = list.len(), "Instance phase entered");
                    self.instance_cache.insert(class.clone(), list);
                    self.instance_class = Some(class.clone());
                }
                self.term = term.clone();
            }
        }

        let phase = query.phase();
        if self.phase != Some(phase) || previous_term != self.term {
            self.selected = 0;
        }
        self.phase = Some(phase);
        self.refilter();
        Some(phase)
    }

    fn cache(&self) -> &[Candidate] {
        match self.phase {
            Some(TagPhase::Class) => &self.class_cache,
            Some(TagPhase::Instance) => self
                .instance_class
                .as_ref()
                .and_then(|c| self.instance_cache.get(c))
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            None => &[],
        }
    }

    fn refilter(&mut self) {
        let needle = self.term.to_lowercase();
        self.filtered = self
            .cache()
            .iter()
            .filter(|c| c.matches_lower(&needle, true))
            .cloned()
            .collect();
        if self.selected >= self.filtered.len() {
            self.selected = 0;
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_some()
    }

    pub fn phase(&self) -> Option<TagPhase> {
        self.phase
    }

    /// Current suggestions, capped in [`ListMode::Short`].
    pub fn suggestions(&self, mode: ListMode) -> Option<TagSuggestions> {
        let phase = self.phase?;
        let items = match mode {
            ListMode::Full => self.filtered.clone(),
            ListMode::Short => {
                let mut items = self.filtered.clone();
                items.sort_by_key(|c| c.name.to_lowercase());
                items.truncate(self.short_list_len);
                items
            }
        };
        Some(TagSuggestions { phase, items })
    }

    pub fn selected(&self) -> Option<&Candidate> {
        self.filtered.get(self.selected)
    }

    pub fn on_key(&mut self, key: ComposerKey, text: &mut String, caret: &mut usize) -> KeyOutcome {
        if !self.is_active() {
            return KeyOutcome::Ignored;
        }
        match key {
            ComposerKey::Up | ComposerKey::Down => {
                self.selected = cycle(self.selected, self.filtered.len(), key).unwrap_or(0);
                KeyOutcome::Moved(self.selected)
            }
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

    /// Splice a suggestion into the buffer.
    ///
    /// A class commit writes `#<class>/` so the next keystroke enters the
    /// instance phase; an instance commit writes `#<class>/<name> ` and records
    /// a [`TagReference`].
    pub fn commit(&mut self, candidate: &Candidate, text: &mut String, caret: &mut usize) -> bool {
        let end = clamp_caret(text, *caret);
        let Some(start) = text[..end].rfind(self.trigger) else {
            return false;
        };

        match self.phase {
            Some(TagPhase::Class) => {
                let class = candidate.group.as_deref().unwrap_or(&candidate.name);
                let replacement = format!("{}{class}/", self.trigger);
                *caret = splice(text, start, end, &replacement);
                true
            }
            Some(TagPhase::Instance) => {
                let Some(class) = self.instance_class.clone() else {
                    return false;
                };
                let replacement = format!("{}{class}/{} ", self.trigger, candidate.name);
                *caret = splice(text, start, end, &replacement);
                self.references.push(TagReference {
                    class,
                    record_id: candidate.id,
                    name: candidate.name.clone(),
                });
                self.deactivate();
                true
            }
            None => false,
        }
    }

    /// References committed since the last [`take_references`](Self::take_references).
    pub fn references(&self) -> &[TagReference] {
        &self.references
    }

    pub fn take_references(&mut self) -> Vec<TagReference> {
        std::mem::take(&mut self.references)
    }

    /// Close the list and drop both caches.
    pub fn deactivate(&mut self) {
        self.phase = None;
        self.instance_class = None;
        self.term.clear();
        self.class_cache.clear();
        self.instance_cache.clear();
        self.filtered.clear();
        self.selected = 0;
    }

    pub fn reset(&mut self) {
        self.deactivate();
        self.references.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Lookup, ScriptedBackend};

    fn classes() -> Vec<Candidate> {
        vec![
            Candidate::new(10, "Sales Order").with_group("sale.order"),
            Candidate::new(11, "Sales Order Line").with_group("sale.order.line"),
            Candidate::new(12, "Sales Team").with_group("crm.team"),
        ]
    }

    fn orders() -> Vec<Candidate> {
        vec![
            Candidate::new(1, "SO001").with_group("sale.order"),
            Candidate::new(2, "SO002").with_group("sale.order"),
            Candidate::new(3, "SO010").with_group("sale.order"),
        ]
    }

    fn backend() -> ScriptedBackend {
        let backend = ScriptedBackend::new();
        *backend.classes.lock() = classes();
        *backend.instances.lock() = orders();
        backend
    }

    #[test]
    fn query_parsing() {
        assert_eq!(TagQuery::parse("sale"), TagQuery::Class("sale".into()));
        assert_eq!(
            TagQuery::parse("sale.order/SO"),
            TagQuery::Instance {
                class: "sale.order".into(),
                term: "SO".into()
            }
        );
        assert_eq!(
            TagQuery::parse("a/b/c"),
            TagQuery::Instance {
                class: "a".into(),
                term: "b/c".into()
            }
        );
    }

    #[tokio::test]
    async fn class_then_instance_phase_lookups() {
        let backend = backend();
        let mut r = TagSuggestionResolver::new('#', 8);

        assert_eq!(r.on_input(&backend, "#sale", 5).await, Some(TagPhase::Class));
        assert_eq!(backend.lookups(), vec![Lookup::Classes("sale".into())]);

        let text = "#sale.order/SO";
        assert_eq!(
            r.on_input(&backend, text, text.len()).await,
            Some(TagPhase::Instance)
        );
        assert_eq!(
            backend.lookups(),
            vec![
                Lookup::Classes("sale".into()),
                Lookup::Instances("sale.order".into(), "SO".into()),
            ]
        );
    }

    #[tokio::test]
    async fn keystrokes_within_a_phase_filter_locally() {
        let backend = backend();
        let mut r = TagSuggestionResolver::new('#', 8);

        r.on_input(&backend, "#sa", 3).await;
        r.on_input(&backend, "#sale", 5).await;
        r.on_input(&backend, "#sale.order", 11).await;
        assert_eq!(backend.lookups().len(), 1);
        let items = r.suggestions(ListMode::Full).unwrap().items;
        assert_eq!(items.len(), 2);

        r.on_input(&backend, "#sale.order/", 12).await;
        r.on_input(&backend, "#sale.order/SO0", 15).await;
        r.on_input(&backend, "#sale.order/SO01", 16).await;
        assert_eq!(backend.lookups().len(), 2);

        let s = r.suggestions(ListMode::Full).unwrap();
        assert_eq!(s.phase, TagPhase::Instance);
        assert_eq!(s.items, vec![Candidate::new(3, "SO010").with_group("sale.order")]);
    }

    #[tokio::test]
    async fn removing_slash_returns_to_class_phase_with_new_lookup() {
        let backend = backend();
        let mut r = TagSuggestionResolver::new('#', 8);

        r.on_input(&backend, "#sale", 5).await;
        r.on_input(&backend, "#sale/", 6).await;
        assert_eq!(r.on_input(&backend, "#sale", 5).await, Some(TagPhase::Class));
        assert_eq!(
            backend.lookups(),
            vec![
                Lookup::Classes("sale".into()),
                Lookup::Instances("sale".into(), String::new()),
                Lookup::Classes("sale".into()),
            ]
        );
    }

    #[tokio::test]
    async fn short_mode_caps_to_eight() {
        let backend = ScriptedBackend::new();
        *backend.classes.lock() = (0..20)
            .map(|i| Candidate::new(i, format!("Model {i:02}")).with_group(format!("x.m{i}")))
            .collect();
        let mut r = TagSuggestionResolver::new('#', 8);

        r.on_input(&backend, "#", 1).await;
        assert_eq!(r.suggestions(ListMode::Full).unwrap().items.len(), 20);
        let short = r.suggestions(ListMode::Short).unwrap();
        assert_eq!(short.items.len(), 8);
        assert_eq!(short.items[0].name, "Model 00");
        assert_eq!(short.phase.as_str(), "class");
    }

    #[tokio::test]
    async fn class_then_instance_commit() {
        let backend = backend();
        let mut r = TagSuggestionResolver::new('#', 8);

        let mut text = "look at #sale".to_string();
        let mut caret = text.len();
        r.on_input(&backend, &text, caret).await;

        let order = Candidate::new(10, "Sales Order").with_group("sale.order");
        assert!(r.commit(&order, &mut text, &mut caret));
        assert_eq!(text, "look at #sale.order/");

        assert_eq!(
            r.on_input(&backend, &text, caret).await,
            Some(TagPhase::Instance)
        );
        let first = r.selected().cloned().unwrap();
        assert_eq!(
            r.on_key(ComposerKey::Enter, &mut text, &mut caret),
            KeyOutcome::Committed(first)
        );
        assert_eq!(text, "look at #sale.order/SO001 ");
        assert_eq!(
            r.take_references(),
            vec![TagReference {
                class: "sale.order".into(),
                record_id: 1,
                name: "SO001".into()
            }]
        );
        assert!(!r.is_active());
    }

    #[tokio::test]
    async fn whitespace_ends_the_tag() {
        let backend = backend();
        let mut r = TagSuggestionResolver::new('#', 8);
        r.on_input(&backend, "#sale", 5).await;
        assert_eq!(r.on_input(&backend, "#sale ", 6).await, None);
        assert!(r.suggestions(ListMode::Full).is_none());
    }
}
