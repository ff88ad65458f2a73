//! Composer helpers: inline mentions (`@`) and entity tags (`#`) while typing.
//!
//! Carets are byte offsets into the input buffer. Out-of-range or mid-character
//! carets are clamped down to the nearest char boundary.

pub mod mention;
pub mod tag;

pub use mention::{MentionResolver, filter_candidates};
pub use tag::{ListMode, TagPhase, TagQuery, TagReference, TagSuggestionResolver, TagSuggestions};

use crate::backend::ChatBackend;
use crate::config::ComposerConfig;
use crate::model::Candidate;

/// Navigation keys the composer reacts to while a suggestion list is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerKey {
    Up,
    Down,
    Enter,
    Escape,
}

/// What a key press did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// No suggestion list was open; the caller should handle the key.
    Ignored,
    /// Selection moved to this index.
    Moved(usize),
    /// The candidate was spliced into the buffer.
    Committed(Candidate),
    /// The suggestion list was closed without committing.
    Dismissed,
}

/// Which triggers a conversation allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationContext {
    /// One-on-one chat with a single assistant: mentions make no sense there.
    pub one_on_one: bool,
    /// Whether backend records may be tagged.
    pub taggable: bool,
}

impl ConversationContext {
    pub fn allows_mentions(&self) -> bool {
        !self.one_on_one
    }

    pub fn allows_tags(&self) -> bool {
        self.taggable
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            one_on_one: false,
            taggable: true,
        }
    }
}

/// What the composer is currently suggesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerState {
    Idle,
    Mention,
    Tag(TagPhase),
}

/// Both resolvers behind the context rules.
pub struct Composer {
    context: ConversationContext,
    pub mentions: MentionResolver,
    pub tags: TagSuggestionResolver,
}

impl Composer {
    pub fn new(config: &ComposerConfig, context: ConversationContext) -> Self {
        Self {
            context,
            mentions: MentionResolver::new(config.mention_trigger),
            tags: TagSuggestionResolver::new(config.tag_trigger, config.short_list_len),
        }
    }

    pub fn context(&self) -> ConversationContext {
        self.context
    }

    pub fn set_context(&mut self, context: ConversationContext) {
        self.context = context;
        self.reset();
    }

    /// Re-run trigger detection after every keystroke.
    pub async fn on_input(
        &mut self,
        backend: &dyn ChatBackend,
        text: &str,
        caret: usize,
    ) -> ComposerState {
        if self.context.allows_mentions() {
            if self.mentions.on_input(backend, text, caret).await {
                self.tags.deactivate();
                return ComposerState::Mention;
            }
        } else {
            self.mentions.deactivate();
        }

        if self.context.allows_tags() {
            if let Some(phase) = self.tags.on_input(backend, text, caret).await {
                return ComposerState::Tag(phase);
            }
        } else {
            self.tags.deactivate();
        }

        ComposerState::Idle
    }

    pub fn on_key(&mut self, key: ComposerKey, text: &mut String, caret: &mut usize) -> KeyOutcome {
        if self.mentions.is_active() {
            return self.mentions.on_key(key, text, caret);
        }
        if self.tags.is_active() {
            return self.tags.on_key(key, text, caret);
        }
        KeyOutcome::Ignored
    }

    /// Drop all caches, selections, and pending references.
    pub fn reset(&mut self) {
        self.mentions.reset();
        self.tags.reset();
    }
}

/// Clamp a caret to the buffer and down to a char boundary.
pub(crate) fn clamp_caret(text: &str, caret: usize) -> usize {
    let mut caret = caret.min(text.len());
    while !text.is_char_boundary(caret) {
        caret -= 1;
    }
    caret
}

/// Replace `text[start..caret]` with `replacement`; returns the new caret.
pub(crate) fn splice(text: &mut String, start: usize, caret: usize, replacement: &str) -> usize {
    text.replace_range(start..caret, replacement);
    start + replacement.len()
}

/// Move a selection index cyclically. `None` when the list is empty.
pub(crate) fn cycle(index: usize, len: usize, key: ComposerKey) -> Option<usize> {
    if len == 0 {
        return None;
    }
    match key {
        ComposerKey::Down => Some((index + 1) % len),
        ComposerKey::Up => Some((index + len - 1) % len),
        _ => Some(index.min(len - 1)),
    }
}
