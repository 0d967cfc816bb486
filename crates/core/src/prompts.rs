//! Prompt Templates
//!
//! Prompts are Markdown files keyed by their file stem. The files shipped in
//! `prompts/` are compiled in as defaults; a directory can override any of them
//! at runtime.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::{collections::HashMap, fs, path::Path, sync::LazyLock};

const GENERATE_PLAN: &str = "generate_plan";
const EXPLAIN_PART: &str = "explain_part";
const ANSWER_QUESTION: &str = "answer_question";
const ANNOTATE_IMAGES: &str = "annotate_images";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern is valid"));

/// Fills `{name}` placeholders in one pass, so substituted text is never
/// scanned again. Unknown placeholders are kept as written.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            values
                .iter()
                .find(|(name, _)| *name == &caps[1])
                .map_or_else(|| caps[0].to_string(), |(_, value)| value.to_string())
        })
        .into_owned()
}

/// The set of prompt templates used by the tutor.
#[derive(Debug, Clone)]
pub struct Prompts {
    templates: HashMap<String, String>,
}

impl Default for Prompts {
    fn default() -> Self {
        let templates = [
            (GENERATE_PLAN, include_str!("../../../prompts/generate_plan.md")),
            (EXPLAIN_PART, include_str!("../../../prompts/explain_part.md")),
            (ANSWER_QUESTION, include_str!("../../../prompts/answer_question.md")),
            (ANNOTATE_IMAGES, include_str!("../../../prompts/annotate_images.md")),
        ]
        .into_iter()
        .map(|(key, body)| (key.to_string(), body.trim_end().to_string()))
        .collect();
        Self { templates }
    }
}

impl Prompts {
    /// Loads the defaults, then overrides them with every `*.md` file in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut prompts = Self::default();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Could not get file stem")?
                    .to_string();
                let body = fs::read_to_string(&path)?;
                prompts.templates.insert(key, body.trim_end().to_string());
            }
        }
        Ok(prompts)
    }

    fn template(&self, key: &str) -> &str {
        // Every key is seeded by `Default`, overrides only replace values.
        self.templates.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn generate_plan(&self, topic: &str) -> String {
        render(self.template(GENERATE_PLAN), &[("topic", topic)])
    }

    pub fn explain_part(&self, topic: &str, part: &str) -> String {
        render(self.template(EXPLAIN_PART), &[("topic", topic), ("part", part)])
    }

    pub fn answer_question(&self, question: &str) -> String {
        render(self.template(ANSWER_QUESTION), &[("question", question)])
    }

    pub fn annotate_images(&self, explanation: &str) -> String {
        render(self.template(ANNOTATE_IMAGES), &[("explanation", explanation)])
    }
}
