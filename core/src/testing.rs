//! Scripted stand-in for the API used by engine and resource tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;

use crate::api::{ApiRequest, Requester};
use crate::error::RequestError;

type Reply = Result<Value, RequestError>;

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    calls: Vec<ApiRequest>,
    fallback: Option<Reply>,
}

#[derive(Default)]
pub(crate) struct FakeApi {
    script: Mutex<Script>,
    gate: Option<Arc<Notify>>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every unscripted request fails as if the device had no network.
    pub(crate) fn offline() -> Self {
        let api = Self::new();
        api.set_fallback(Err(RequestError::Network("no route to host".into())));
        api
    }

    /// Requests wait for a permit on `gate` before answering.
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            script: Mutex::default(),
            gate: Some(gate),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reply(&self, reply: Reply) -> &Self {
        self.script().replies.push_back(reply);
        self
    }

    pub(crate) fn ok(&self, value: Value) -> &Self {
        self.reply(Ok(value))
    }

    pub(crate) fn fail(&self, status: u16, message: &str) -> &Self {
        self.reply(Err(RequestError::Http {
            status,
            message: message.to_string(),
        }))
    }

    pub(crate) fn set_fallback(&self, reply: Reply) {
        self.script().fallback = Some(reply);
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.script().calls.clone()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| format!("{} {}", c.method, c.path))
            .collect()
    }
}

impl Requester for FakeApi {
    async fn request(&self, req: ApiRequest) -> Result<Value, RequestError> {
        let reply = {
            let mut script = self.script();
            script.calls.push(req);
            script
                .replies
                .pop_front()
                .or_else(|| script.fallback.clone())
                .unwrap_or(Ok(Value::Null))
        };
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        reply
    }
}
