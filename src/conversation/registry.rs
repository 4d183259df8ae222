//! Conversations owned by one bot instance.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::session::ConversationHandle;

/// Append-only (until pruned) list of conversations, in creation order.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: RwLock<Vec<ConversationHandle>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, conversation: ConversationHandle) {
        debug!(conversation_id = %conversation.id(), "Conversation registered");
        self.write().push(conversation);
    }

    /// First active conversation whose id appears in `ids`, checked in order.
    ///
    /// Candidates are collected before any conversation lock is taken, so a
    /// handler that starts a new conversation cannot deadlock against a lookup.
    /// A conversation that is locked right now counts as active; the caller
    /// re-checks under the lock.
    pub fn find_active(&self, ids: &[String]) -> Option<ConversationHandle> {
        let candidates: Vec<ConversationHandle> = {
            let conversations = self.read();
            ids.iter()
                .filter_map(|id| conversations.iter().find(|c| c.id() == id).cloned())
                .collect()
        };
        candidates.into_iter().find(in_use_or_active)
    }

    pub fn get(&self, id: &str) -> Option<ConversationHandle> {
        self.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Snapshot of every registered conversation.
    pub fn snapshot(&self) -> Vec<ConversationHandle> {
        self.read().clone()
    }

    /// Conversations that are active or in use right now.
    pub fn active(&self) -> Vec<ConversationHandle> {
        self.snapshot().into_iter().filter(in_use_or_active).collect()
    }

    /// Drop ended conversations. Returns how many were removed.
    ///
    /// Never blocks on a conversation lock, so it may be called from inside
    /// a handler or activation callback. Locked conversations are kept.
    pub fn prune_inactive(&self) -> usize {
        // Status only moves toward terminal, so a stale read is safe
        let ended: HashSet<String> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.try_status().is_some_and(|s| s.is_terminal()))
            .map(|c| c.id().to_string())
            .collect();

        let mut conversations = self.write();
        let before = conversations.len();
        conversations.retain(|c| !ended.contains(c.id()));
        let removed = before - conversations.len();
        if removed > 0 {
            debug!(removed, remaining = conversations.len(), "Pruned conversations");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ConversationHandle>> {
        self.conversations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ConversationHandle>> {
        self.conversations.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn in_use_or_active(conversation: &ConversationHandle) -> bool {
    conversation.try_status().is_none_or(|s| s.is_active())
}
