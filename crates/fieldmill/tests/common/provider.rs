//! Inference provider that answers from a per-document script.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use fieldmill::checkpoint::record::source_file_name;
use fieldmill::{Extraction, FieldValue, InferenceProvider, ProviderError};

/// What the provider returns for one document.
#[derive(Debug, Clone)]
pub enum Answer {
    /// A single extraction with these `(field, value, justification)` triples.
    Fields(Vec<(&'static str, &'static str, &'static str)>),
    /// An upstream failure with this message.
    Error(&'static str),
    /// An empty result list.
    Nothing,
}

/// Answers by document file name. Documents without a script entry get a
/// generic answer for `country`, `country_alpha_3_code` and `has_policy`.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<HashMap<String, Answer>>,
    calls: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, file_name: &str, answer: Answer) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_string(), answer);
        self
    }

    /// Replaces the answer for a document after construction.
    pub fn set(&self, file_name: &str, answer: Answer) {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_string(), answer);
    }

    /// Drops every scripted error so later calls succeed.
    pub fn heal(&self) {
        self.script
            .lock()
            .unwrap()
            .retain(|_, a| !matches!(a, Answer::Error(_)));
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Documents processed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(
        &self,
        document: &Path,
        _instructions: &str,
    ) -> Result<Vec<Extraction>, ProviderError> {
        let name = source_file_name(document);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(name.clone());

        let answer = self.script.lock().unwrap().get(&name).cloned();
        let triples = match answer {
            Some(Answer::Error(message)) => {
                return Err(ProviderError::Malformed(message.to_string()))
            }
            Some(Answer::Nothing) => return Ok(vec![]),
            Some(Answer::Fields(triples)) => triples,
            None => vec![
                ("country", "Austria", ""),
                ("country_alpha_3_code", "AUT", ""),
                ("has_policy", "no", "not mentioned"),
            ],
        };

        let extraction: Extraction = triples
            .into_iter()
            .map(|(field, value, justification)| {
                (field.to_string(), FieldValue::new(value, justification))
            })
            .collect();
        Ok(vec![extraction])
    }
}
