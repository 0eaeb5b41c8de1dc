//! Shared test doubles: scripted and echoing models.
#![allow(dead_code)]

use agent_kit::{Content, Llm, LlmRequest, LlmResponse, Result, Role, TokenUsage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A model that replays a fixed script of responses and records every
/// request it receives.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<LlmRequest>>,
    repeat_last: bool,
    last: Mutex<Option<LlmResponse>>,
}

impl ScriptedLlm {
    /// Replays `responses` in order; once exhausted, answers with empty
    /// text.
    pub fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            repeat_last: false,
            last: Mutex::new(None),
        })
    }

    /// Replays `responses` in order; once exhausted, keeps repeating the
    /// last one forever.
    pub fn looping(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            repeat_last: true,
            last: Mutex::new(None),
        })
    }

    /// Every request observed so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let next = self.responses.lock().unwrap().pop_front();
        let response = match next {
            Some(response) => {
                *self.last.lock().unwrap() = Some(response.clone());
                response
            }
            None if self.repeat_last => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| LlmResponse::text("")),
            None => LlmResponse::text(""),
        };

        Ok(LlmResponse {
            usage: response.usage.or(Some(TokenUsage::new(10, 5))),
            ..response
        })
    }
}

/// A model that echoes the text of the last user content it sees.
pub struct EchoLlm;

#[async_trait]
impl Llm for EchoLlm {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let echoed = request
            .contents
            .iter()
            .rev()
            .find(|content| content.role == Role::User)
            .map(Content::text)
            .unwrap_or_default();
        Ok(LlmResponse::text(echoed))
    }
}
