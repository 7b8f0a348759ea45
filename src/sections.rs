//! Labelled fenced-section parser.
//!
//! Generator responses are free text containing blocks like
//!
//! ````text
//! ```terraform
//! resource "aws_s3_bucket" "b" {}
//! ```
//! ````
//!
//! [`Sections::parse`] turns such text into a map from label to body. Only the
//! first block for a given label is kept. Unlabelled blocks are ignored.

use crate::error::GenerationError;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

const FENCE: &str = "```";

static REASONING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"));

/// Removes `<think>...</think>` spans emitted by reasoning models.
pub fn strip_reasoning(text: &str) -> Cow<'_, str> {
    REASONING.replace_all(text, "")
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sections {
    bodies: HashMap<String, String>,
}

impl Sections {
    pub fn parse(text: &str) -> Self {
        let mut bodies = HashMap::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in text.lines() {
            let trimmed = line.trim_start();
            match current.take() {
                None => {
                    if let Some(label) = trimmed.strip_prefix(FENCE) {
                        current = Some((label.trim().to_string(), Vec::new()));
                    }
                }
                Some((label, mut body)) => {
                    if trimmed.trim_end() == FENCE {
                        Self::insert(&mut bodies, label, &body);
                    } else {
                        body.push(line);
                        current = Some((label, body));
                    }
                }
            }
        }

        // A response cut off mid-block still yields what was received.
        if let Some((label, body)) = current {
            debug!("Unterminated '{}' section, keeping partial body", label);
            Self::insert(&mut bodies, label, &body);
        }

        Self { bodies }
    }

    fn insert(bodies: &mut HashMap<String, String>, label: String, body: &[&str]) {
        if label.is_empty() {
            return;
        }
        bodies.entry(label).or_insert_with(|| body.join("\n"));
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.bodies.get(label).map(String::as_str)
    }

    /// Body of a section that must be present.
    pub fn require(&self, label: &str) -> Result<&str, GenerationError> {
        self.get(label).ok_or_else(|| GenerationError::MissingSection {
            label: label.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}
