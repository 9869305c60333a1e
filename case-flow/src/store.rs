use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::model::ChatTurn;

/// Identifies one conversation of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatKey {
    pub user_id: String,
    pub chat_id: String,
}

impl ChatKey {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// Trait for storing and retrieving chat history
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, key: &ChatKey, turn: ChatTurn) -> Result<()>;
    /// Most recent turns of the conversation, oldest first.
    async fn history(&self, key: &ChatKey) -> Result<Vec<ChatTurn>>;
    async fn clear(&self, key: &ChatKey) -> Result<()>;
}

/// In-memory implementation of ChatStore
///
/// Keeps at most `max_turns` turns per conversation, dropping the oldest.
pub struct InMemoryChatStore {
    chats: Arc<DashMap<ChatKey, Vec<ChatTurn>>>,
    max_turns: usize,
}

impl InMemoryChatStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            chats: Arc::new(DashMap::new()),
            max_turns: max_turns.max(1),
        }
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn append(&self, key: &ChatKey, turn: ChatTurn) -> Result<()> {
        let mut turns = self.chats.entry(key.clone()).or_default();
        turns.push(turn);
        if turns.len() > self.max_turns {
            let excess = turns.len() - self.max_turns;
            turns.drain(..excess);
        }
        Ok(())
    }

    async fn history(&self, key: &ChatKey) -> Result<Vec<ChatTurn>> {
        Ok(self
            .chats
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, key: &ChatKey) -> Result<()> {
        self.chats.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatRole;

    #[tokio::test]
    async fn conversations_are_isolated() {
        let store = InMemoryChatStore::new(10);
        let a = ChatKey::new("user-1", "chat-1");
        let b = ChatKey::new("user-1", "chat-2");
        store.append(&a, ChatTurn::user("first")).await.unwrap();
        store.append(&b, ChatTurn::user("other")).await.unwrap();
        store.append(&a, ChatTurn::assistant("reply")).await.unwrap();

        let history = store.history(&a).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].content, "reply");
        assert_eq!(store.history(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_capped_to_recent_turns() {
        let store = InMemoryChatStore::new(3);
        let key = ChatKey::new("u", "c");
        for i in 0..5 {
            store.append(&key, ChatTurn::user(format!("m{i}"))).await.unwrap();
        }
        let contents: Vec<String> = store
            .history(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|turn| turn.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn clear_forgets_the_conversation() {
        let store = InMemoryChatStore::new(3);
        let key = ChatKey::new("u", "c");
        store.append(&key, ChatTurn::user("hello")).await.unwrap();
        store.clear(&key).await.unwrap();
        assert!(store.history(&key).await.unwrap().is_empty());
    }
}
