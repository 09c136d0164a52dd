// ABOUTME: Registry of issued API tokens with a per-user reverse index.
// ABOUTME: Both indices live under one lock so readers never see them disagree.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{ControlError, Result};

/// Length of generated token strings.
pub const TOKEN_LENGTH: usize = 32;

pub type UserId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiToken {
    pub token: String,
    pub user_id: UserId,
    pub note: String,
}

#[derive(Default)]
struct TokenIndex {
    by_token: HashMap<String, ApiToken>,
    /// Tokens per user in issuance order. Never holds an empty list.
    by_user: HashMap<UserId, Vec<String>>,
}

impl TokenIndex {
    fn unlink(&mut self, token: &str, user_id: UserId) {
        if let Some(list) = self.by_user.get_mut(&user_id) {
            list.retain(|t| t != token);
            if list.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
    }
}

#[derive(Default)]
pub struct TokenRegistry {
    index: RwLock<TokenIndex>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh token for `user_id` and register it.
    pub async fn issue(&self, user_id: UserId, note: impl Into<String>) -> ApiToken {
        let token = ApiToken {
            token: generate_token(),
            user_id,
            note: note.into(),
        };
        self.upsert(token.clone()).await;
        token
    }

    /// Insert or replace a token. Re-assigning a token to a different user
    /// moves it between reverse lists.
    pub async fn upsert(&self, token: ApiToken) {
        let mut index = self.index.write().await;
        if let Some(previous) = index.by_token.get(&token.token).cloned() {
            if previous.user_id == token.user_id {
                index.by_token.insert(token.token.clone(), token);
                return;
            }
            index.unlink(&previous.token, previous.user_id);
        }
        index
            .by_user
            .entry(token.user_id)
            .or_default()
            .push(token.token.clone());
        index.by_token.insert(token.token.clone(), token);
    }

    pub async fn get(&self, token: &str) -> Option<ApiToken> {
        self.index.read().await.by_token.get(token).cloned()
    }

    /// Revoke a token, updating both indices in one critical section.
    pub async fn remove(&self, token: &str) -> Result<ApiToken> {
        let mut index = self.index.write().await;
        let removed = index
            .by_token
            .remove(token)
            .ok_or_else(|| ControlError::not_found("token", token))?;
        index.unlink(&removed.token, removed.user_id);
        Ok(removed)
    }

    /// Drop every token a user owns. Returns how many were removed.
    pub async fn remove_user(&self, user_id: UserId) -> usize {
        let mut index = self.index.write().await;
        let tokens = index.by_user.remove(&user_id).unwrap_or_default();
        for token in &tokens {
            index.by_token.remove(token);
        }
        tokens.len()
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Vec<ApiToken> {
        let index = self.index.read().await;
        index
            .by_user
            .get(&user_id)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|t| index.by_token.get(t).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn has_user(&self, user_id: UserId) -> bool {
        self.index.read().await.by_user.contains_key(&user_id)
    }

    pub async fn for_each(&self, mut visit: impl FnMut(&ApiToken)) {
        for token in self.index.read().await.by_token.values() {
            visit(token);
        }
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
