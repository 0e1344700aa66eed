use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Where a conversation is in the goal-setting flow. The goal strings live
/// inside the variants, so a pending goal exists only while confirming and a
/// confirmed goal only while working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingGoal,
    ConfirmingGoal { pending_goal: String },
    Working { goal: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub state: SessionState,
    /// Successful exchanges in `Working` since the last reflection nudge.
    pub exchange_count: u32,
    /// Exchanges needed before the next nudge.
    pub threshold: u32,
    pub goal_set_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn awaiting_goal(threshold: u32) -> Self {
        Self {
            state: SessionState::AwaitingGoal,
            exchange_count: 0,
            threshold,
            goal_set_at: None,
        }
    }

    pub fn working(goal: impl Into<String>, threshold: u32) -> Self {
        Self {
            state: SessionState::Working { goal: goal.into() },
            exchange_count: 0,
            threshold,
            goal_set_at: Some(Utc::now()),
        }
    }

    pub fn goal(&self) -> Option<&str> {
        match &self.state {
            SessionState::Working { goal } => Some(goal),
            _ => None,
        }
    }

    pub fn pending_goal(&self) -> Option<&str> {
        match &self.state {
            SessionState::ConfirmingGoal { pending_goal } => Some(pending_goal),
            _ => None,
        }
    }

    pub(crate) fn propose_goal(&mut self, pending_goal: String) {
        self.state = SessionState::ConfirmingGoal { pending_goal };
    }

    pub(crate) fn confirm_goal(&mut self, goal: String, threshold: u32) {
        self.state = SessionState::Working { goal };
        self.exchange_count = 0;
        self.threshold = threshold;
        self.goal_set_at = Some(Utc::now());
    }

    pub(crate) fn reset_goal(&mut self) {
        self.state = SessionState::AwaitingGoal;
        self.exchange_count = 0;
        self.goal_set_at = None;
    }
}

/// Storage for per-conversation sessions. The engine is the only writer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Session>;

    async fn put(&self, key: &str, session: Session);
}

/// In-process store; sessions live as long as the process.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Option<Session> {
        self.sessions.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, session: Session) {
        self.sessions.write().await.insert(key.to_string(), session);
    }
}
