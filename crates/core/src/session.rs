//! Tutor Session
//!
//! The session is a sequential state machine:
//!
//! ```text
//! IDLE -> PLANNING -> TEACHING -> Q_AND_A -> (TEACHING | FINISHED)
//! ```
//!
//! It owns the topic, plan, turn history and part cursor, and talks to the
//! generation service through a single dialogue opened when teaching begins.
//! Persistence is not its concern: every [`Reply`] names the checkpoint the
//! caller should write, and the caller decides how (see
//! [`crate::history::Checkpointer`]).

use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    augment::{ExplanationAugmenter, Segment, plain_text},
    generation::{Dialogue, GenerationService},
    history::{Checkpoint, LessonStatus, Turn},
    prompts::Prompts,
};

/// Words that end the session from any non-terminal state.
pub const STOP_WORDS: &[&str] = &["stop", "cancel", "quit", "exit"];

/// Words that move on to the next part while answering questions.
pub const ADVANCE_WORDS: &[&str] = &["next", "continue", "no", "nope", "n", "ok"];

/// Expected plan length; anything else is used but logged.
const PLAN_PARTS: std::ops::RangeInclusive<usize> = 4..=7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Idle,
    Planning,
    Teaching,
    QAndA,
    Finished,
}

impl SessionState {
    /// Whether the state is terminal. No input is processed once terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "IDLE",
            SessionState::Planning => "PLANNING",
            SessionState::Teaching => "TEACHING",
            SessionState::QAndA => "Q_AND_A",
            SessionState::Finished => "FINISHED",
        })
    }
}

/// What the learner meant by a line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Stop,
    Advance,
    Question(String),
    Empty,
}

impl Intent {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Intent::Empty;
        }
        let word = trimmed.to_lowercase();
        if STOP_WORDS.contains(&word.as_str()) {
            Intent::Stop
        } else if ADVANCE_WORDS.contains(&word.as_str()) {
            Intent::Advance
        } else {
            Intent::Question(trimmed.to_string())
        }
    }
}

/// Splits raw plan text into part titles.
///
/// Lines are trimmed and blank lines dropped. Leading list numbering or bullets
/// are removed when a title remains after removing them.
pub fn parse_plan(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let stripped = strip_list_marker(line);
            let title = if stripped.is_empty() { line } else { stripped };
            title.to_string()
        })
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
    {
        return rest.trim_start();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim_start();
        }
    }
    line
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has already been started")]
    AlreadyStarted,
    #[error("session has not been started")]
    NotStarted,
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("session is finished")]
    Finished,
    #[error("generation failed: {0}")]
    Generation(#[source] anyhow::Error),
}

/// The outcome of one session step, ready to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub state: SessionState,
    pub message: String,
    pub segments: Vec<Segment>,
    /// Present on the first explanation of the course.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
    /// The status the caller should checkpoint after this step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<LessonStatus>,
}

impl Reply {
    fn text(state: SessionState, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            state,
            segments: vec![Segment::text(message.clone())],
            message,
            plan: None,
            checkpoint: None,
        }
    }

    fn with_checkpoint(mut self, status: LessonStatus) -> Self {
        self.checkpoint = Some(status);
        self
    }
}

pub struct TutorSession {
    generator: Arc<dyn GenerationService>,
    augmenter: Arc<ExplanationAugmenter>,
    prompts: Prompts,
    topic: String,
    plan: Vec<String>,
    /// Set once a reply has carried the plan.
    plan_delivered: bool,
    history: Vec<Turn>,
    part_index: usize,
    state: SessionState,
    dialogue: Option<Box<dyn Dialogue>>,
    trail: Vec<SessionState>,
}

impl TutorSession {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        augmenter: Arc<ExplanationAugmenter>,
        prompts: Prompts,
    ) -> Self {
        Self {
            generator,
            augmenter,
            prompts,
            topic: String::new(),
            plan: Vec::new(),
            plan_delivered: false,
            history: Vec::new(),
            part_index: 0,
            state: SessionState::Idle,
            dialogue: None,
            trail: vec![SessionState::Idle],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn part_index(&self) -> usize {
        self.part_index
    }

    /// Every state entered so far, starting with IDLE.
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    /// The record to write for a checkpoint with the given status.
    pub fn checkpoint(&self, status: LessonStatus) -> Checkpoint {
        Checkpoint {
            topic: self.topic.clone(),
            plan: self.plan.clone(),
            history: self.history.clone(),
            status,
            last_completed_part: self
                .part_index
                .checked_sub(1)
                .and_then(|i| self.plan.get(i))
                .cloned(),
        }
    }

    /// Stores the topic, builds the plan and teaches the first part.
    pub async fn start(&mut self, topic: &str) -> Result<Reply, SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Finished => return Err(SessionError::Finished),
            _ => return Err(SessionError::AlreadyStarted),
        }
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(SessionError::EmptyTopic);
        }

        self.topic = topic.to_string();
        self.transition(SessionState::Planning);
        self.plan_course().await
    }

    /// Processes one line of learner input.
    pub async fn handle_input(&mut self, input: &str) -> Result<Reply, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Finished);
        }

        let intent = Intent::parse(input);
        if intent == Intent::Stop {
            return self.stop();
        }

        match self.state {
            SessionState::Idle => Err(SessionError::NotStarted),
            SessionState::Planning => self.plan_course().await,
            // Only reachable after a failed explanation; retry the same part.
            SessionState::Teaching => match intent {
                Intent::Empty => Ok(Reply::text(
                    SessionState::Teaching,
                    "Say anything to try this part again, or 'stop' to quit.",
                )),
                _ => self.teach().await,
            },
            SessionState::QAndA => match intent {
                Intent::Advance => {
                    self.part_index += 1;
                    self.transition(SessionState::Teaching);
                    self.teach().await
                }
                Intent::Question(question) => self.answer(&question).await,
                Intent::Empty | Intent::Stop => Ok(Reply::text(
                    SessionState::QAndA,
                    "Ask a question about this part, or say 'next' to continue.",
                )),
            },
            SessionState::Finished => Err(SessionError::Finished),
        }
    }

    /// Ends the session from any non-terminal state.
    pub fn stop(&mut self) -> Result<Reply, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Finished);
        }
        info!(topic = %self.topic, part_index = self.part_index, "Session stopped by learner");
        self.transition(SessionState::Finished);
        Ok(Reply::text(SessionState::Finished, "Stopping the course. Your progress has been saved.")
            .with_checkpoint(LessonStatus::Stopped))
    }

    async fn plan_course(&mut self) -> Result<Reply, SessionError> {
        let plan = match self.generator.generate_plan(&self.topic).await {
            Ok(raw) => parse_plan(&raw),
            Err(e) => {
                error!(topic = %self.topic, error = ?e, "Plan generation failed");
                return Ok(self.abandon("I couldn't put together a plan for this topic."));
            }
        };
        if plan.is_empty() {
            error!(topic = %self.topic, "Generated plan has no usable parts");
            return Ok(self.abandon("The generated plan was empty, so the course cannot start."));
        }
        if !PLAN_PARTS.contains(&plan.len()) {
            warn!(topic = %self.topic, parts = plan.len(), "Plan length outside the expected range");
        }
        info!(topic = %self.topic, parts = plan.len(), "Lesson plan ready");

        self.plan = plan;
        self.part_index = 0;
        if self.dialogue.is_none() {
            self.dialogue = Some(self.generator.open_dialogue());
        }
        self.transition(SessionState::Teaching);
        self.teach().await
    }

    fn abandon(&mut self, message: &str) -> Reply {
        self.transition(SessionState::Finished);
        Reply::text(SessionState::Finished, message).with_checkpoint(LessonStatus::Stopped)
    }

    async fn teach(&mut self) -> Result<Reply, SessionError> {
        let Some(part) = self.plan.get(self.part_index).cloned() else {
            info!(topic = %self.topic, "Course completed");
            self.transition(SessionState::Finished);
            return Ok(Reply::text(
                SessionState::Finished,
                "Congratulations! You have completed the course.",
            )
            .with_checkpoint(LessonStatus::Completed));
        };

        let prompt = self.prompts.explain_part(&self.topic, &part);
        let explanation = self.send(&prompt).await?;
        self.history.push(Turn::assistant(explanation.clone()));

        let segments = self.augmenter.augment(&explanation).await;
        self.transition(SessionState::QAndA);
        let plan = (!self.plan_delivered).then(|| self.plan.clone());
        self.plan_delivered = true;
        Ok(Reply {
            state: SessionState::QAndA,
            message: plain_text(&segments),
            segments,
            plan,
            checkpoint: Some(LessonStatus::InProgress),
        })
    }

    async fn answer(&mut self, question: &str) -> Result<Reply, SessionError> {
        self.history.push(Turn::user(question));
        let prompt = self.prompts.answer_question(question);
        let answer = self.send(&prompt).await?;
        self.history.push(Turn::assistant(answer.clone()));
        Ok(Reply::text(SessionState::QAndA, answer).with_checkpoint(LessonStatus::InProgress))
    }

    async fn send(&mut self, prompt: &str) -> Result<String, SessionError> {
        let generator = &self.generator;
        let dialogue = self
            .dialogue
            .get_or_insert_with(|| generator.open_dialogue());
        dialogue.send(prompt).await.map_err(|e| {
            warn!(state = %self.state, error = ?e, "Dialogue call failed");
            SessionError::Generation(e)
        })
    }

    fn transition(&mut self, to: SessionState) {
        info!(from = %self.state, to = %to, part_index = self.part_index, "Session transition");
        self.state = to;
        self.trail.push(to);
    }
}
