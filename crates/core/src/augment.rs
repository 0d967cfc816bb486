//! Explanation Augmenter
//!
//! Asks the generation service to annotate an explanation with inline
//! `<<IMAGE: query>>` markers, then splits the annotated text into an ordered
//! list of text and image segments. Every image marker is resolved eagerly, so
//! rendering a segment list never performs I/O.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::{
    generation::GenerationService,
    images::{ImageMatch, ImageResolver},
    prompts::Prompts,
};

/// `<<IMAGE: ` + single-line query + `>>`, non-greedy up to the first `>>`.
static IMAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<<IMAGE: ([^\n]*?)>>").expect("marker pattern is valid"));

/// One unit of a rendered explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        content: String,
    },
    Image {
        query: String,
        result: Option<ImageMatch>,
    },
}

impl Segment {
    pub fn text(content: impl Into<String>) -> Self {
        Segment::Text {
            content: content.into(),
        }
    }
}

/// Concatenation of every text segment, in order.
pub fn plain_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Text { content } => Some(content.as_str()),
            Segment::Image { .. } => None,
        })
        .collect()
}

/// A piece of annotated text before image resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    Text(&'a str),
    Marker(&'a str),
}

/// Splits annotated text on image markers, left to right.
///
/// Empty gaps produce no token. Anything that is not a complete single-line
/// marker, such as an unterminated `<<IMAGE:`, stays literal text.
pub fn tokenize(annotated: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for captures in IMAGE_MARKER.captures_iter(annotated) {
        let (Some(whole), Some(query)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if whole.start() > last {
            tokens.push(Token::Text(&annotated[last..whole.start()]));
        }
        tokens.push(Token::Marker(query.as_str()));
        last = whole.end();
    }
    if last < annotated.len() {
        tokens.push(Token::Text(&annotated[last..]));
    }
    tokens
}

/// Removes a surrounding Markdown code fence, if the whole reply is fenced.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    if !trimmed.starts_with("```") {
        return reply;
    }
    let body = match trimmed.split_once('\n') {
        Some((_opening, rest)) => rest,
        None => return "",
    };
    match body.rfind('\n') {
        Some(idx) if body[idx + 1..].starts_with("```") => &body[..idx],
        None if body.starts_with("```") => "",
        _ => body,
    }
}

pub struct ExplanationAugmenter {
    generator: Arc<dyn GenerationService>,
    resolver: Arc<ImageResolver>,
    prompts: Prompts,
}

impl ExplanationAugmenter {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        resolver: Arc<ImageResolver>,
        prompts: Prompts,
    ) -> Self {
        Self {
            generator,
            resolver,
            prompts,
        }
    }

    /// Turns an explanation into text and image segments.
    ///
    /// Never fails: if annotation fails, or the reply carries no marker, the
    /// result is the original explanation as a single text segment.
    pub async fn augment(&self, explanation: &str) -> Vec<Segment> {
        if explanation.trim().is_empty() {
            return vec![Segment::text(explanation)];
        }

        let reply = match self
            .generator
            .complete(&self.prompts.annotate_images(explanation))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Image annotation failed, using plain explanation");
                return vec![Segment::text(explanation)];
            }
        };

        let tokens = tokenize(strip_code_fence(&reply));
        if !tokens.iter().any(|t| matches!(t, Token::Marker(_))) {
            return vec![Segment::text(explanation)];
        }

        let mut segments = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token {
                Token::Text(content) => segments.push(Segment::text(content)),
                Token::Marker(raw) => {
                    let query = raw.trim().to_string();
                    debug!(%query, "Resolving image marker");
                    let result = self.resolver.resolve(&query).await;
                    segments.push(Segment::Image { query, result });
                }
            }
        }
        segments
    }
}
