//! Deterministic doubles for the model backends.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::context_source::{ContextItem, ContextSource};
use crate::embeddings::Embedder;
use crate::error::GenerationError;
use crate::generator::Generator;
use crate::retrieval::Tags;

/// Embeds text as word counts over a fixed vocabulary, one axis per word.
pub struct AxisEmbedder {
    axes: Vec<String>,
    fail_on: Option<String>,
}

impl AxisEmbedder {
    pub fn new(axes: &[&str]) -> Self {
        Self {
            axes: axes.iter().map(|a| a.to_lowercase()).collect(),
            fail_on: None,
        }
    }

    /// Fail any call whose input contains `word`.
    pub fn failing_on(mut self, word: &str) -> Self {
        self.fail_on = Some(word.to_lowercase());
        self
    }

    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.axes.len()];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if let Some(axis) = self.axes.iter().position(|a| *a == word) {
                vector[axis] += 1.0;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for AxisEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if let Some(word) = &self.fail_on
            && texts.iter().any(|t| t.to_lowercase().contains(word.as_str()))
        {
            anyhow::bail!("embedding backend rejected input containing '{word}'");
        }
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn model_name(&self) -> &str {
        "axis-test"
    }
}

/// Returns the same vector for every input.
pub struct FixedEmbedder {
    vector: Vec<f32>,
}

impl FixedEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(vec![self.vector.clone(); texts.len()])
    }

    fn model_name(&self) -> &str {
        "fixed-test"
    }
}

/// Plays back queued outcomes, then answers with a fixed string.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    fallback: String,
    seen: Mutex<Vec<Vec<ContextItem>>>,
}

impl ScriptedGenerator {
    pub fn answering(answer: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: answer.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, outcome: Result<String, GenerationError>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Context passed on each call, oldest first.
    pub fn contexts(&self) -> Vec<Vec<ContextItem>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _query: &str, context: &[ContextItem]) -> Result<String, GenerationError> {
        self.seen.lock().unwrap().push(context.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Always returns the same external items.
pub struct StaticContext(pub Vec<ContextItem>);

impl StaticContext {
    pub fn snippets(snippets: &[&str]) -> Self {
        Self(
            snippets
                .iter()
                .map(|s| ContextItem {
                    content: s.to_string(),
                    metadata: Tags::from([("source".to_string(), serde_json::json!("static"))]),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ContextSource for StaticContext {
    async fn fetch(&self, _query: &str) -> Vec<ContextItem> {
        self.0.clone()
    }
}
