//! Conversation persistence.
//!
//! The chat session only talks to [`ConversationStore`]; [`MemoryStore`] keeps
//! everything in process and is what the binary and tests run against.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{error::ServiceError, model::Role};

pub const DEFAULT_USERNAME: &str = "default_user";

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create_default_user(&self) -> Result<User, ServiceError>;

    async fn create_conversation(
        &self,
        user_id: i64,
        title: &str,
    ) -> Result<Conversation, ServiceError>;

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, ServiceError>;

    async fn create_message(
        &self,
        content: &str,
        role: Role,
        conversation_id: i64,
        image_url: Option<&str>,
    ) -> Result<Message, ServiceError>;

    /// Messages of a conversation in insertion order.
    async fn get_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, ServiceError>;
}

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    conversations: HashMap<i64, Conversation>,
    messages: Vec<Message>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.tables.lock().messages.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create_default_user(&self) -> Result<User, ServiceError> {
        let mut tables = self.tables.lock();
        if let Some(user) = tables.users.iter().find(|u| u.username == DEFAULT_USERNAME) {
            return Ok(user.clone());
        }
        let user = User {
            id: tables.next_id(),
            username: DEFAULT_USERNAME.to_string(),
            created_at: Utc::now(),
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn create_conversation(
        &self,
        user_id: i64,
        title: &str,
    ) -> Result<Conversation, ServiceError> {
        let mut tables = self.tables.lock();
        if !tables.users.iter().any(|u| u.id == user_id) {
            return Err(ServiceError::not_found(format!("User {user_id} not found")));
        }
        let now = Utc::now();
        let conversation = Conversation {
            id: tables.next_id(),
            user_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, ServiceError> {
        Ok(self.tables.lock().conversations.get(&id).cloned())
    }

    async fn create_message(
        &self,
        content: &str,
        role: Role,
        conversation_id: i64,
        image_url: Option<&str>,
    ) -> Result<Message, ServiceError> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        match tables.conversations.get_mut(&conversation_id) {
            Some(conversation) => conversation.updated_at = now,
            None => return Err(ServiceError::not_found("Conversation not found")),
        }
        let message = Message {
            id: tables.next_id(),
            conversation_id,
            role,
            content: content.to_string(),
            image_url: image_url.map(str::to_string),
            created_at: now,
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, ServiceError> {
        let tables = self.tables.lock();
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

/// Title for a conversation opened by `message`: its first 35 characters.
pub fn title_from_message(message: &str) -> String {
    message.chars().take(35).collect()
}
