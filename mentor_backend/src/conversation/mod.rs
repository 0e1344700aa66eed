//! Per-conversation goal flow.
//!
//! A session starts by asking for a goal, gets a refined draft from the model,
//! waits for the user to accept it (or replace it) and then answers requests
//! with the goal baked into the system prompt. Every few working exchanges a
//! reflection nudge is appended to the answer.
//!
//! Messages for the same session are handled one at a time; different
//! sessions run in parallel.

pub mod reinforcement;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::BotConfig;
use crate::prompts::PromptSet;
use crate::task_client::{ClientError, TaskClient};

pub use reinforcement::ReinforcementScheduler;
pub use session::{MemorySessionStore, Session, SessionState, SessionStore};

/// Replies accepted as "yes, keep the refined goal" (compared case-insensitively).
pub const AFFIRMATIVE_REPLIES: &[&str] = &["да", "ок", "хорошо", "yes", "+"];

const GREETING: &str =
    "👋 Привет! Я помогу сформулировать методическую цель и буду держать её в фокусе нашей работы.";
const GOAL_REQUEST: &str = "Опишите цель, над которой хотите работать, и я помогу её уточнить.";
const PROPOSAL_HEADER: &str = "Предлагаю такую формулировку цели:";
const CONFIRM_HINT: &str =
    "Если она подходит, ответьте «да». Или пришлите свою формулировку, и я приму её как есть.";
const NO_GOAL: &str = "Цель пока не задана.";
const EMPTY_MESSAGE: &str = "Пришлите, пожалуйста, текстовое сообщение.";

/// Exclusive access to one session, released on drop.
pub struct SessionGuard {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// One inbound event from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Start,
    ShowGoal,
    ResetGoal,
}

impl Inbound {
    /// Map bot commands (`/start`, `/goal`, `/newgoal`, `/reset`, optionally
    /// with an `@botname` suffix) to events. Anything else is text.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return Self::Text(text.to_string());
        };

        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_lowercase();

        match name.as_str() {
            "start" => Self::Start,
            "goal" => Self::ShowGoal,
            "newgoal" | "reset" => Self::ResetGoal,
            _ => Self::Text(text.to_string()),
        }
    }

    /// Whether handling this event may involve a backend call.
    pub fn may_generate(&self) -> bool {
        matches!(self, Self::Text(text) if !text.trim().is_empty())
    }
}

/// Outbound messages for one inbound event, in sending order.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub messages: Vec<String>,
    /// Set when a backend call failed; `messages` then holds its user text.
    pub failure: Option<ClientError>,
}

impl Reply {
    fn text(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            failure: None,
        }
    }

    fn failed(error: ClientError) -> Self {
        Self {
            messages: vec![error.user_message()],
            failure: Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

pub fn is_affirmative(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    AFFIRMATIVE_REPLIES.contains(&normalized.as_str())
}

pub struct ConversationEngine {
    client: TaskClient,
    store: Arc<dyn SessionStore>,
    prompts: PromptSet,
    scheduler: ReinforcementScheduler,
    default_goal: Option<String>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationEngine {
    pub fn new(
        client: TaskClient,
        store: Arc<dyn SessionStore>,
        prompts: PromptSet,
        scheduler: ReinforcementScheduler,
    ) -> Self {
        Self {
            client,
            store,
            prompts,
            scheduler,
            default_goal: None,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BotConfig, client: TaskClient, store: Arc<dyn SessionStore>) -> Self {
        Self::new(
            client,
            store,
            config.prompts.clone(),
            ReinforcementScheduler::from_config(&config.reinforcement),
        )
        .with_default_goal(config.default_goal.clone())
    }

    /// Sessions seen for the first time start working on this goal.
    pub fn with_default_goal(mut self, goal: Option<String>) -> Self {
        self.default_goal = goal
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());
        self
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.store.get(session_id).await
    }

    /// Process one inbound event for `session_id` and return what to send
    /// back. Waits for earlier events of the same session to finish first.
    pub async fn handle(&self, session_id: &str, inbound: Inbound) -> Reply {
        let guard = self.lock_session(session_id).await;
        self.handle_locked(&guard, inbound).await
    }

    /// Take exclusive access to a session. Waiters are served in the order
    /// they called this, so callers that must do work before `handle_locked`
    /// (such as sending a placeholder) keep their place in the queue.
    pub async fn lock_session(&self, session_id: &str) -> SessionGuard {
        let lock = {
            let mut locks = self.session_locks.lock().await;
            // Entries nobody holds or waits on are only referenced by the map.
            locks.retain(|key, lock| key == session_id || Arc::strong_count(lock) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        SessionGuard {
            session_id: session_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    pub async fn handle_locked(&self, guard: &SessionGuard, inbound: Inbound) -> Reply {
        let session_id = guard.session_id();
        let mut session = match self.store.get(session_id).await {
            Some(session) => session,
            None => {
                tracing::info!("New session {}", session_id);
                self.new_session()
            }
        };

        let reply = self.step(&mut session, inbound).await;
        self.store.put(session_id, session).await;
        reply
    }

    fn new_session(&self) -> Session {
        let threshold = self.scheduler.sample();
        match &self.default_goal {
            Some(goal) => Session::working(goal.clone(), threshold),
            None => Session::awaiting_goal(threshold),
        }
    }

    async fn step(&self, session: &mut Session, inbound: Inbound) -> Reply {
        let text = match inbound {
            Inbound::Start => return self.greet(session),
            Inbound::ShowGoal => return show_goal(session),
            Inbound::ResetGoal => return reset_goal(session),
            Inbound::Text(text) => text,
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Reply::text(EMPTY_MESSAGE);
        }

        match session.state.clone() {
            SessionState::AwaitingGoal => self.refine_goal(session, trimmed).await,
            SessionState::ConfirmingGoal { pending_goal } => {
                self.confirm_goal(session, pending_goal, &text)
            }
            SessionState::Working { goal } => self.answer(session, &goal, trimmed).await,
        }
    }

    fn greet(&self, session: &Session) -> Reply {
        match session.goal() {
            Some(goal) => Reply::text(format!("{}\n\n🎯 Текущая цель: {}", GREETING, goal)),
            None => Reply::text(format!("{}\n\n{}", GREETING, GOAL_REQUEST)),
        }
    }

    async fn refine_goal(&self, session: &mut Session, draft: &str) -> Reply {
        match self.client.run(&self.prompts.goal_refinement, draft).await {
            Ok(refined) => {
                let reply = format!("{}\n\n{}\n\n{}", PROPOSAL_HEADER, refined, CONFIRM_HINT);
                session.propose_goal(refined);
                Reply::text(reply)
            }
            Err(e) => Reply::failed(e),
        }
    }

    /// Any reply that is not an affirmative token becomes the goal exactly as
    /// the user sent it.
    fn confirm_goal(&self, session: &mut Session, pending_goal: String, reply: &str) -> Reply {
        let goal = if is_affirmative(reply) {
            pending_goal
        } else {
            tracing::debug!("Refined goal replaced by user wording");
            reply.to_string()
        };

        let message = format!(
            "✅ Цель установлена: {}\n\nТеперь присылайте ваши запросы.",
            goal.trim()
        );
        session.confirm_goal(goal, self.scheduler.sample());
        Reply::text(message)
    }

    async fn answer(&self, session: &mut Session, goal: &str, request: &str) -> Reply {
        let system_prompt = self.prompts.render_working(goal);
        match self.client.run(&system_prompt, request).await {
            Ok(answer) => {
                let mut messages = vec![answer];
                if self.scheduler.record_exchange(session) {
                    messages.push(self.prompts.reflection.clone());
                }
                Reply {
                    messages,
                    failure: None,
                }
            }
            Err(e) => Reply::failed(e),
        }
    }
}

fn show_goal(session: &Session) -> Reply {
    match &session.state {
        SessionState::Working { goal } => {
            let since = session
                .goal_set_at
                .map(|at| format!(" (с {})", at.format("%d.%m.%Y")))
                .unwrap_or_default();
            Reply::text(format!("🎯 Текущая цель{}: {}", since, goal))
        }
        SessionState::ConfirmingGoal { pending_goal } => Reply::text(format!(
            "{} Черновик ждёт подтверждения:\n\n{}\n\n{}",
            NO_GOAL, pending_goal, CONFIRM_HINT
        )),
        SessionState::AwaitingGoal => Reply::text(format!("{}\n\n{}", NO_GOAL, GOAL_REQUEST)),
    }
}

fn reset_goal(session: &mut Session) -> Reply {
    if session.state != SessionState::AwaitingGoal {
        tracing::info!("Goal reset");
        session.reset_goal();
    }
    Reply::text(GOAL_REQUEST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_client::{SubmitPayload, TaskBackend, TaskClientConfig};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Answers every task with `"<prefix>: <user text>"`.
    #[derive(Default)]
    struct EchoBackend {
        tasks: Mutex<HashMap<String, SubmitPayload>>,
        next_id: AtomicU32,
        fail: AtomicBool,
        poll_delay: Option<Duration>,
    }

    impl EchoBackend {
        fn slow(delay: Duration) -> Self {
            Self {
                poll_delay: Some(delay),
                ..Self::default()
            }
        }

        async fn system_prompts(&self) -> Vec<String> {
            self.tasks
                .lock()
                .await
                .values()
                .filter_map(|p| p.system_prompt().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl TaskBackend for EchoBackend {
        async fn submit(&self, payload: &SubmitPayload, _timeout: Duration) -> Result<Value, ClientError> {
            let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.tasks.lock().await.insert(id.clone(), payload.clone());
            Ok(json!({ "request_id": id, "status": "starting" }))
        }

        async fn poll(&self, task_id: &str, _timeout: Duration) -> Result<Value, ClientError> {
            if let Some(delay) = self.poll_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Ok(json!({ "status": "failed", "error": "boom" }));
            }
            let tasks = self.tasks.lock().await;
            let user = tasks
                .get(task_id)
                .and_then(|p| p.user_text())
                .unwrap_or_default();
            Ok(json!({ "status": "success", "output": format!("refined: {}", user) }))
        }
    }

    fn engine_with(backend: Arc<EchoBackend>, store: Arc<MemorySessionStore>) -> ConversationEngine {
        let client = TaskClient::new(
            backend,
            TaskClientConfig {
                submit_timeout: Duration::from_secs(10),
                poll_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
                max_attempts: 3,
            },
        );
        ConversationEngine::new(
            client,
            store,
            PromptSet {
                reflection: "REFLECT".to_string(),
                ..PromptSet::default()
            },
            ReinforcementScheduler::new(3, 5),
        )
    }

    fn engine() -> (ConversationEngine, Arc<EchoBackend>, Arc<MemorySessionStore>) {
        let backend = Arc::new(EchoBackend::default());
        let store = Arc::new(MemorySessionStore::new());
        (engine_with(backend.clone(), store.clone()), backend, store)
    }

    fn text(s: &str) -> Inbound {
        Inbound::Text(s.to_string())
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Inbound::parse("/start"), Inbound::Start);
        assert_eq!(Inbound::parse(" /goal "), Inbound::ShowGoal);
        assert_eq!(Inbound::parse("/newgoal@mentor_bot"), Inbound::ResetGoal);
        assert_eq!(Inbound::parse("/reset now"), Inbound::ResetGoal);
        assert_eq!(Inbound::parse("/unknown"), text("/unknown"));
        assert_eq!(Inbound::parse("привет"), text("привет"));
        assert!(text("x").may_generate());
        assert!(!text("  ").may_generate());
        assert!(!Inbound::ShowGoal.may_generate());
    }

    #[test]
    fn affirmative_tokens_are_case_insensitive() {
        for token in ["да", "ДА", " Ок ", "хорошо", "Yes", "+"] {
            assert!(is_affirmative(token), "{}", token);
        }
        assert!(!is_affirmative("нет"));
        assert!(!is_affirmative("да, но"));
    }

    #[tokio::test]
    async fn draft_then_yes_confirms_refined_goal() {
        let (engine, _, _) = engine();

        let reply = engine.handle("chat", text("научить детей узлам")).await;
        assert!(!reply.is_failure());
        assert!(reply.messages[0].contains("refined: научить детей узлам"));

        let session = engine.session("chat").await.unwrap();
        assert_eq!(session.pending_goal(), Some("refined: научить детей узлам"));

        engine.handle("chat", text("да")).await;
        let session = engine.session("chat").await.unwrap();
        assert_eq!(
            session.state,
            SessionState::Working {
                goal: "refined: научить детей узлам".to_string()
            }
        );
        assert_eq!(session.exchange_count, 0);
        assert!((3..=5).contains(&session.threshold));
    }

    #[tokio::test]
    async fn non_affirmative_reply_becomes_goal_verbatim() {
        let (engine, _, _) = engine();
        engine.handle("chat", text("черновик")).await;
        engine.handle("chat", text("Научить вязать узлы")).await;

        let session = engine.session("chat").await.unwrap();
        assert_eq!(session.goal(), Some("Научить вязать узлы"));
        assert_eq!(session.pending_goal(), None);
    }

    #[tokio::test]
    async fn working_requests_use_goal_prompt_and_reflect_on_threshold() {
        let (engine, backend, store) = engine();
        store.put("chat", Session::working("Научить вязать узлы", 3)).await;

        for i in 1..=2 {
            let reply = engine.handle("chat", text(&format!("запрос {}", i))).await;
            assert_eq!(reply.messages, vec![format!("refined: запрос {}", i)]);
        }
        assert_eq!(engine.session("chat").await.unwrap().exchange_count, 2);

        let reply = engine.handle("chat", text("запрос 3")).await;
        assert_eq!(
            reply.messages,
            vec!["refined: запрос 3".to_string(), "REFLECT".to_string()]
        );

        let session = engine.session("chat").await.unwrap();
        assert_eq!(session.exchange_count, 0);
        assert!((3..=5).contains(&session.threshold));

        let prompts = backend.system_prompts().await;
        assert_eq!(prompts.len(), 3);
        assert!(prompts.iter().all(|p| p.contains("«Научить вязать узлы»")));
    }

    #[tokio::test]
    async fn failed_call_leaves_session_untouched() {
        let (engine, backend, store) = engine();
        let mut before = Session::working("цель", 3);
        before.exchange_count = 2;
        store.put("chat", before.clone()).await;
        backend.fail.store(true, Ordering::SeqCst);

        let reply = engine.handle("chat", text("запрос")).await;
        assert!(reply.is_failure());
        assert_eq!(reply.messages, vec!["❌ Gen-API ошибка: boom".to_string()]);
        assert_eq!(engine.session("chat").await.unwrap(), before);

        let reply = engine.handle("fresh", text("черновик")).await;
        assert!(matches!(reply.failure, Some(ClientError::TaskFailed { .. })));
        assert_eq!(
            engine.session("fresh").await.unwrap().state,
            SessionState::AwaitingGoal
        );
    }

    #[tokio::test]
    async fn override_goal_keeps_user_whitespace() {
        let (engine, _, _) = engine();
        engine.handle("chat", text("черновик")).await;
        let reply = engine.handle("chat", text("  Научить вязать узлы\n")).await;

        assert_eq!(
            engine.session("chat").await.unwrap().goal(),
            Some("  Научить вязать узлы\n")
        );
        assert!(reply.messages[0].contains("Цель установлена: Научить вязать узлы\n"));
    }

    #[tokio::test]
    async fn idle_session_locks_are_pruned() {
        let (engine, _, _) = engine();
        for id in ["a", "b", "c"] {
            engine.handle(id, Inbound::ShowGoal).await;
        }
        assert_eq!(engine.session_locks.lock().await.len(), 1);

        let held = engine.lock_session("a").await;
        engine.handle("b", Inbound::ShowGoal).await;
        let locks = engine.session_locks.lock().await;
        assert!(locks.contains_key("a"));
        assert!(locks.contains_key("b"));
        drop(locks);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn held_session_guard_blocks_later_events() {
        let (engine, _, store) = engine();
        let engine = Arc::new(engine);
        let guard = engine.lock_session("chat").await;

        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle("chat", text("да")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        engine.handle_locked(&guard, text("черновик")).await;
        drop(guard);
        waiting.await.unwrap();

        assert_eq!(
            store.get("chat").await.unwrap().goal(),
            Some("refined: черновик")
        );
    }

    #[tokio::test]
    async fn reset_and_show_goal() {
        let (engine, _, store) = engine();
        store.put("chat", Session::working("цель", 3)).await;

        let reply = engine.handle("chat", Inbound::ShowGoal).await;
        assert!(reply.messages[0].contains("цель"));
        assert_eq!(engine.session("chat").await.unwrap().goal(), Some("цель"));

        engine.handle("chat", Inbound::ResetGoal).await;
        let session = engine.session("chat").await.unwrap();
        assert_eq!(session.state, SessionState::AwaitingGoal);
        assert_eq!(session.goal(), None);

        let reply = engine.handle("chat", Inbound::ShowGoal).await;
        assert!(reply.messages[0].starts_with(NO_GOAL));
    }

    #[tokio::test]
    async fn start_and_empty_text_do_not_call_backend() {
        let (engine, backend, _) = engine();
        let reply = engine.handle("chat", Inbound::Start).await;
        assert!(reply.messages[0].contains(GOAL_REQUEST));

        let reply = engine.handle("chat", text("   ")).await;
        assert_eq!(reply.messages, vec![EMPTY_MESSAGE.to_string()]);
        assert_eq!(backend.next_id.load(Ordering::SeqCst), 0);
        assert_eq!(
            engine.session("chat").await.unwrap().state,
            SessionState::AwaitingGoal
        );
    }

    #[tokio::test]
    async fn default_goal_starts_sessions_in_working() {
        let (engine, _, _) = engine();
        let engine = engine.with_default_goal(Some("  Научить вязать узлы ".to_string()));

        let reply = engine.handle("chat", Inbound::Start).await;
        assert!(reply.messages[0].contains("Научить вязать узлы"));
        assert_eq!(
            engine.session("chat").await.unwrap().goal(),
            Some("Научить вязать узлы")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_isolated_under_concurrency() {
        let backend = Arc::new(EchoBackend::slow(Duration::from_millis(50)));
        let store = Arc::new(MemorySessionStore::new());
        let engine = engine_with(backend.clone(), store.clone());

        tokio::join!(
            engine.handle("alice", text("цель Алисы")),
            engine.handle("bob", text("цель Боба")),
        );
        tokio::join!(
            engine.handle("alice", text("да")),
            engine.handle("bob", text("Своя цель Боба")),
        );
        tokio::join!(
            engine.handle("alice", text("вопрос")),
            engine.handle("bob", text("вопрос")),
        );

        let alice = store.get("alice").await.unwrap();
        let bob = store.get("bob").await.unwrap();
        assert_eq!(alice.goal(), Some("refined: цель Алисы"));
        assert_eq!(bob.goal(), Some("Своя цель Боба"));
        assert_eq!(alice.exchange_count, 1);
        assert_eq!(bob.exchange_count, 1);

        let prompts = backend.system_prompts().await;
        assert_eq!(
            prompts
                .iter()
                .filter(|p| p.contains("«refined: цель Алисы»"))
                .count(),
            1
        );
        assert_eq!(prompts.iter().filter(|p| p.contains("«Своя цель Боба»")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_session_messages_are_serialized() {
        let backend = Arc::new(EchoBackend::slow(Duration::from_millis(50)));
        let store = Arc::new(MemorySessionStore::new());
        let engine = Arc::new(engine_with(backend, store.clone()));
        store.put("chat", Session::working("цель", 10)).await;

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.handle("chat", text(&format!("q{}", i))).await })
            })
            .collect();
        for handle in handles {
            assert!(!handle.await.unwrap().is_failure());
        }

        assert_eq!(store.get("chat").await.unwrap().exchange_count, 4);
    }
}
