//! Prompt texts. Opaque to the rest of the crate apart from the `{goal}`
//! placeholder in the working template.

use serde::{Deserialize, Serialize};

pub const GOAL_PLACEHOLDER: &str = "{goal}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    /// System prompt for turning a draft goal into a refined one.
    #[serde(default = "default_goal_refinement")]
    pub goal_refinement: String,
    /// System prompt for regular requests once a goal is confirmed.
    #[serde(default = "default_working_template")]
    pub working_template: String,
    /// Nudge appended after every few exchanges.
    #[serde(default = "default_reflection")]
    pub reflection: String,
}

fn default_goal_refinement() -> String {
    "Ты опытный методист. Пользователь присылает черновик методической цели. \
     Переформулируй её в одну конкретную, измеримую и достижимую цель. \
     Ответь только формулировкой цели, без пояснений."
        .to_string()
}

fn default_working_template() -> String {
    "Ты помощник-методист. Методическая цель пользователя: «{goal}». \
     Отвечай на запросы пользователя так, чтобы каждый ответ приближал его к этой цели. \
     Если запрос уводит в сторону от цели, мягко напомни о ней."
        .to_string()
}

fn default_reflection() -> String {
    "🤔 Пауза для рефлексии: насколько последние шаги приблизили вас к цели? \
     Что получилось, а что стоит скорректировать?"
        .to_string()
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            goal_refinement: default_goal_refinement(),
            working_template: default_working_template(),
            reflection: default_reflection(),
        }
    }
}

impl PromptSet {
    /// Working system prompt for `goal`. Templates without the placeholder
    /// get the goal appended instead.
    pub fn render_working(&self, goal: &str) -> String {
        if self.working_template.contains(GOAL_PLACEHOLDER) {
            self.working_template.replace(GOAL_PLACEHOLDER, goal)
        } else {
            format!("{}\n\nЦель: {}", self.working_template.trim_end(), goal)
        }
    }
}
