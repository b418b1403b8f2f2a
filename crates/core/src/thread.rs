//! The displayed thread and the reducer that folds agent events into it.

use crate::events::{AgentEvent, ContentPart};
use crate::sender::Sender;
use crate::thread_item::ThreadItem;

/// Insertion-ordered list of thread items. Items are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Thread {
    items: Vec<ThreadItem>,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item and returns its index.
    pub fn push(&mut self, item: ThreadItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&ThreadItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ThreadItem> {
        self.items.get_mut(index)
    }

    pub fn items(&self) -> &[ThreadItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Structural change made to a [`Thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadChange {
    Appended(usize),
    Updated(usize),
}

impl ThreadChange {
    pub fn index(self) -> usize {
        match self {
            Self::Appended(index) | Self::Updated(index) => index,
        }
    }
}

/// Folds agent events into thread mutations.
///
/// Holds the index of the item currently being streamed into. Content that
/// continues the current item's role is merged into it; anything else opens a
/// new item. A turn end always overwrites with the final payload.
#[derive(Debug, Clone, Default)]
pub struct ThreadReducer {
    current: Option<usize>,
}

impl ThreadReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn apply(&mut self, thread: &mut Thread, event: &AgentEvent) -> Vec<ThreadChange> {
        let mut changes = Vec::new();

        match event {
            AgentEvent::TurnStart => self.current = None,
            AgentEvent::Token { parts } => {
                for part in parts {
                    self.apply_partial(thread, part, &mut changes);
                }
            }
            // Multi-part final outputs are not reconciled; the last part wins.
            AgentEvent::TurnEnd { output } => {
                if let Some(part) = output.last() {
                    self.apply_final(thread, part, &mut changes);
                }
            }
            AgentEvent::Other { .. } => {}
        }

        changes
    }

    fn apply_partial(
        &mut self,
        thread: &mut Thread,
        part: &ContentPart,
        changes: &mut Vec<ThreadChange>,
    ) {
        match part {
            ContentPart::Text { text } => {
                let index = self.ensure_current(thread, Sender::Agent, None, changes);
                if let Some(item) = thread.get_mut(index) {
                    item.append_text(text, None);
                    record_update(changes, index);
                }
            }
            ContentPart::ToolUse { name, input } => {
                let index = self.ensure_current(thread, Sender::Tool, name.as_deref(), changes);
                if let (Some(input), Some(item)) = (input, thread.get_mut(index)) {
                    item.append_text(input, name.as_deref());
                    record_update(changes, index);
                }
            }
            ContentPart::Unknown => {}
        }
    }

    fn apply_final(
        &mut self,
        thread: &mut Thread,
        part: &ContentPart,
        changes: &mut Vec<ThreadChange>,
    ) {
        match part {
            ContentPart::Text { text } => {
                let index = self.ensure_current(thread, Sender::Agent, None, changes);
                if let Some(item) = thread.get_mut(index) {
                    item.update(text.as_str(), None);
                    record_update(changes, index);
                }
            }
            ContentPart::ToolUse {
                name,
                input: Some(input),
            } => {
                let index = self.ensure_current(thread, Sender::Tool, name.as_deref(), changes);
                if let Some(item) = thread.get_mut(index) {
                    item.update(input.as_str(), name.as_deref());
                    record_update(changes, index);
                }
            }
            ContentPart::ToolUse { input: None, .. } | ContentPart::Unknown => {}
        }
    }

    /// Returns the current item if it has `sender`, otherwise opens a new one.
    fn ensure_current(
        &mut self,
        thread: &mut Thread,
        sender: Sender,
        tool_name: Option<&str>,
        changes: &mut Vec<ThreadChange>,
    ) -> usize {
        if let Some(index) = self.current
            && thread.get(index).is_some_and(|item| item.sender() == sender)
        {
            return index;
        }

        let item = ThreadItem::new(String::new(), sender, tool_name.map(str::to_string));
        let index = thread.push(item);
        changes.push(ThreadChange::Appended(index));
        self.current = Some(index);
        index
    }
}

fn record_update(changes: &mut Vec<ThreadChange>, index: usize) {
    let already_recorded = matches!(
        changes.last(),
        Some(ThreadChange::Appended(last) | ThreadChange::Updated(last)) if *last == index
    );
    if !already_recorded {
        changes.push(ThreadChange::Updated(index));
    }
}
