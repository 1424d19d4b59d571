//! Personality chat core
//!
//! The single-call "chat with context" operation: moderation and rate
//! gates, personality selection, image-intent detection with a transient
//! persona swap around generation, and history-backed LLM conversation.

use serde::Serialize;

use crate::error::Result;
use crate::llm::ChatMessage;
use crate::lora::StylePreference;
use crate::state::AppState;

/// Outcome of one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub text: String,
    /// Set when the turn kicked off a generation
    pub job_id: Option<String>,
    /// True when the turn was refused (moderation or rate limit)
    pub refused: bool,
}

impl ChatReply {
    fn refusal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            job_id: None,
            refused: true,
        }
    }
}

/// Detected request to generate an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIntent {
    /// The subject phrase with generation verbs stripped
    pub prompt: String,
}

const GENERATION_VERBS: &[&str] = &["generate", "draw", "render", "paint", "create", "make"];
const SUBJECT_PHRASES: &[&str] = &[
    "an image of",
    "a picture of",
    "an illustration of",
    "image of",
    "picture of",
    "art of",
    "illustration of",
];
const LEADING_FILLERS: &[&str] = &["me", "a", "an", "the", "please"];

/// Detect image-generation intent: a generation verb (or a subject phrase
/// like "image of") followed by a non-empty subject.
pub fn detect_image_intent(message: &str) -> Option<ImageIntent> {
    let lowered = message.to_lowercase();
    let trimmed = lowered.trim();

    let mut subject: Option<&str> = None;

    for verb in GENERATION_VERBS {
        if let Some(rest) = trimmed.strip_prefix(verb) {
            // "create" and "make" only count with an image phrase, so plain
            // "make dinner" stays a chat message
            let needs_phrase = matches!(*verb, "create" | "make");
            let rest = rest.trim_start();
            if needs_phrase {
                if let Some(after) = SUBJECT_PHRASES
                    .iter()
                    .find_map(|phrase| rest.strip_prefix(phrase))
                {
                    subject = Some(after);
                    break;
                }
            } else {
                subject = Some(rest);
                break;
            }
        }
    }

    if subject.is_none() {
        // "show me a picture of a fox", "can you draw ..."
        for phrase in SUBJECT_PHRASES {
            if let Some(index) = trimmed.find(phrase) {
                subject = Some(&trimmed[index + phrase.len()..]);
                break;
            }
        }
    }

    let mut subject = subject?.trim().to_string();

    // Strip leading fillers ("draw me a dragon" -> "dragon")
    loop {
        let mut stripped = false;
        for filler in LEADING_FILLERS {
            let prefix = format!("{} ", filler);
            if let Some(rest) = subject.strip_prefix(&prefix) {
                subject = rest.trim_start().to_string();
                stripped = true;
            }
        }
        if !stripped {
            break;
        }
    }
    for phrase in SUBJECT_PHRASES {
        let prefix = format!("{} ", phrase);
        if let Some(rest) = subject.strip_prefix(&prefix) {
            subject = rest.to_string();
        }
    }

    if subject.split_whitespace().next().is_none() {
        return None;
    }

    Some(ImageIntent { prompt: subject })
}

/// Strip internal reasoning spans from provider output
pub fn strip_thinking(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(open) = rest.find("<think") else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..open]);
        let after_open = &rest[open..];
        if let Some(i) = after_open.find("</thinking>") {
            rest = &after_open[i + "</thinking>".len()..];
        } else if let Some(i) = after_open.find("</think>") {
            rest = &after_open[i + "</think>".len()..];
        } else {
            break; // unterminated span: drop the rest
        }
    }
    out.trim().to_string()
}

impl AppState {
    /// One chat turn. Handles moderation, rate limits, personality,
    /// image-intent branching, and history persistence.
    pub async fn chat_with_context(
        &self,
        user_id: &str,
        context_key: &str,
        message: &str,
    ) -> Result<ChatReply> {
        // 1. Moderation gate
        let status = self.convo.check_status(user_id)?;
        match status.status.as_str() {
            "suspended" => {
                return Ok(ChatReply::refusal(format!(
                    "account suspended: {}",
                    status.reason.as_deref().unwrap_or("no reason recorded")
                )));
            }
            "timeout" => {
                let remaining = status
                    .timeout_until
                    .map(|until| (until - crate::now_ms()).max(0) / 1000)
                    .unwrap_or(0);
                return Ok(ChatReply::refusal(format!(
                    "timed out for another {}s",
                    remaining
                )));
            }
            _ => {}
        }

        // 2. Rate gate
        let (allowed, reset) =
            self.convo
                .check_rate(user_id, "chat", self.config.chat_rate_limit)?;
        if !allowed {
            return Ok(ChatReply::refusal(format!(
                "rate limited, try again in {}s",
                reset
            )));
        }

        // 3. Personality (locked wins)
        let personality = self.convo.effective_personality(user_id)?;
        let settings = self.convo.get_settings(user_id)?;

        // 4. Image-intent branch
        if let Some(intent) = detect_image_intent(message) {
            let (allowed, reset) =
                self.convo
                    .check_rate(user_id, "generate", self.config.generate_rate_limit)?;
            if !allowed {
                return Ok(ChatReply::refusal(format!(
                    "generation rate limited, try again in {}s",
                    reset
                )));
            }

            // Transient persona swap: the personality's image-injection
            // prompt drives the enhancer; persisted settings are untouched
            let assist = self
                .llm
                .image_assist
                .chat(
                    &[
                        ChatMessage::system(&personality.image_injection_prompt),
                        ChatMessage::user(format!(
                            "Create an enhanced image prompt for: {}",
                            intent.prompt
                        )),
                    ],
                    0.3,
                    500,
                )
                .await;

            let enhanced_prompt = if assist.success && !assist.content.trim().is_empty() {
                strip_thinking(&assist.content)
            } else {
                intent.prompt.clone()
            };

            let report = self
                .orchestrate(&enhanced_prompt, StylePreference::Balanced, Some(user_id))
                .await?;

            let reply_text = format!(
                "{} Generating: {}",
                personality.emoji, report.final_prompt
            );
            self.convo
                .append(context_key, user_id, "user", message, None)?;
            self.convo
                .append(context_key, user_id, "assistant", &reply_text, None)?;
            self.convo
                .record_action(user_id, "chat", Some(context_key))?;
            self.convo
                .record_action(user_id, "generate", Some(context_key))?;

            return Ok(ChatReply {
                text: reply_text,
                job_id: Some(report.job_id),
                refused: false,
            });
        }

        // 5. Plain conversation
        let history = self
            .convo
            .history(context_key, settings.max_context_messages)?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&personality.system_prompt));
        for stored in &history {
            match stored.role.as_str() {
                "user" => messages.push(ChatMessage::user(&stored.content)),
                "assistant" => messages.push(ChatMessage::assistant(&stored.content)),
                _ => {}
            }
        }
        messages.push(ChatMessage::user(message));

        let outcome = self
            .llm
            .chat
            .chat(&messages, settings.temperature, 2000)
            .await;

        self.convo
            .append(context_key, user_id, "user", message, None)?;

        if !outcome.success {
            return Err(crate::error::EaselError::Upstream {
                component: "llm",
                message: outcome
                    .error
                    .unwrap_or_else(|| "provider returned no response".to_string()),
            });
        }

        let text = strip_thinking(&outcome.content);
        self.convo
            .append(context_key, user_id, "assistant", &text, None)?;
        self.convo
            .record_action(user_id, "chat", Some(context_key))?;

        Ok(ChatReply {
            text,
            job_id: None,
            refused: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_detects_generation_verbs() {
        assert_eq!(
            detect_image_intent("generate a cat in a hat").unwrap().prompt,
            "cat in a hat"
        );
        assert_eq!(
            detect_image_intent("draw me a dragon").unwrap().prompt,
            "dragon"
        );
        assert_eq!(
            detect_image_intent("paint a stormy sea").unwrap().prompt,
            "stormy sea"
        );
        assert_eq!(
            detect_image_intent("create an image of a sunset over mountains")
                .unwrap()
                .prompt,
            "sunset over mountains"
        );
        assert_eq!(
            detect_image_intent("show me a picture of a fox").unwrap().prompt,
            "fox"
        );
    }

    #[test]
    fn intent_requires_a_subject() {
        assert!(detect_image_intent("generate").is_none());
        assert!(detect_image_intent("draw").is_none());
        assert!(detect_image_intent("picture of").is_none());
    }

    #[test]
    fn plain_chat_is_not_intent() {
        assert!(detect_image_intent("I like paintings").is_none());
        assert!(detect_image_intent("make dinner tonight").is_none());
        assert!(detect_image_intent("what is a render farm?").is_none());
    }

    #[test]
    fn adding_a_verb_activates_intent() {
        // The heuristic's floor: prefixing an image verb to a message
        // activates image-assist
        let message = "a red fox in the snow";
        assert!(detect_image_intent(message).is_none());
        assert!(detect_image_intent(&format!("draw {}", message)).is_some());
        assert!(detect_image_intent(&format!("generate {}", message)).is_some());
    }

    #[test]
    fn thinking_spans_are_stripped() {
        assert_eq!(
            strip_thinking("<think>internal</think>hello"),
            "hello"
        );
        assert_eq!(
            strip_thinking("<thinking>steps</thinking>answer"),
            "answer"
        );
        assert_eq!(strip_thinking("plain reply"), "plain reply");
        assert_eq!(strip_thinking("a <think>x</think> b"), "a  b".trim());
    }

    #[tokio::test]
    async fn suspended_users_are_refused() -> Result<()> {
        let (state, _dir) = crate::state::tests::test_state();
        state.convo.suspend_user("u1", "abuse", "admin")?;

        let reply = state.chat_with_context("u1", "dm:1", "hello").await?;
        assert!(reply.refused);
        assert!(reply.text.contains("suspended"));
        // Nothing persisted for a refused turn
        assert!(state.convo.history("dm:1", 10)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rate_limited_users_are_refused() -> Result<()> {
        let (state, _dir) = crate::state::tests::test_state();
        for _ in 0..state.config.chat_rate_limit {
            state.convo.record_action("u1", "chat", None)?;
        }

        let reply = state.chat_with_context("u1", "dm:1", "hello").await?;
        assert!(reply.refused);
        assert!(reply.text.contains("rate limited"));
        Ok(())
    }

    #[tokio::test]
    async fn chat_turn_persists_both_sides() -> Result<()> {
        let (state, _dir) = crate::state::tests::test_state();

        let reply = state
            .chat_with_context("u1", "channel:9", "hello there")
            .await?;
        assert!(!reply.refused);
        assert!(reply.job_id.is_none());
        // Mock chat provider echoes through the chat channel
        assert!(reply.text.starts_with("[chat]"));

        let history = state.convo.history("channel:9", 10)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        Ok(())
    }

    #[tokio::test]
    async fn image_intent_branches_to_generation() -> Result<()> {
        let (state, _dir) = crate::state::tests::test_state();

        let reply = state
            .chat_with_context("u1", "dm:1", "draw me a red fox")
            .await?;
        assert!(!reply.refused);
        let job_id = reply.job_id.expect("intent turn should enqueue a job");
        assert!(state.queue.get(&job_id).is_ok());

        // Persisted personality is untouched by the transient swap
        assert_eq!(state.convo.get_settings("u1")?.personality, "default");
        Ok(())
    }
}
