//! Scripted backend for development & testing
//!
//! Plays back queued completions and errors in order, so runs work
//! without any model API.

use super::{Completion, ModelBackend};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct Call {
    model: String,
    system: String,
    user: String,
}

pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<std::result::Result<Completion, String>>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(self, text: &str) -> Self {
        self.push(Ok(Completion {
            text: text.to_string(),
            prompt_tokens: Some(0),
            completion_tokens: Some(text.chars().count() as u32),
            total_tokens: Some(text.chars().count() as u32),
        }))
    }

    pub fn push_error(self, message: &str) -> Self {
        self.push(Err(message.to_string()))
    }

    /// Response once the script runs out. Without one, calls fail.
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, entry: std::result::Result<Completion, String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
        self
    }

    /// Models requested so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|c| c.model.clone())
            .collect()
    }

    pub fn last_system_prompt(&self) -> Option<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|c| c.system.clone())
    }

    pub fn last_user_prompt(&self) -> Option<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|c| c.user.clone())
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<Completion> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Call {
                model: model.to_string(),
                system: system.to_string(),
                user: user.to_string(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(message)) => Err(PipelineError::Provider(message)),
            None => match &self.fallback {
                Some(text) => Ok(Completion::text(text.clone())),
                None => Err(PipelineError::Provider("script exhausted".to_string())),
            },
        }
    }
}
