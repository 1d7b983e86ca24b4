use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use super::Transport;
use crate::rpc::CallError;

/// Transport fake that replays scripted replies and records emitted events
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Value, CallError>>>,
    emitted: Mutex<Vec<(String, Value)>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_emit: AtomicBool,
    sends: AtomicU32,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_reply(&self, reply: Result<Value, CallError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn failing_connect(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_emit(self) -> Self {
        self.fail_emit.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<(), CallError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(CallError::Connection("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, pattern: &str, _payload: Value) -> Result<Value, CallError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::Unknown(format!("no scripted reply for {}", pattern))))
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), CallError> {
        if self.fail_emit.load(Ordering::SeqCst) {
            return Err(CallError::Connection("broker unreachable".into()));
        }
        self.emitted.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }
}
