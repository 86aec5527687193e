// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Single-flight authorization broker.
//!
//! At most one caller operation is in flight at a time, gated by a
//! one-permit semaphore that is tried, never awaited: a second request
//! while the permit is out fails immediately with `Busy`. While an
//! operation needs user input it parks a pending prompt in the broker;
//! the confirmation surface reads it, the user answers (or closes it,
//! which counts as a denial), and the waiting operation resumes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};
use url::Url;
use uuid::Uuid;

use crate::error::AgentError;
use crate::policy::Condition;

/// The user's answer to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptReply {
    pub accept: bool,
    /// Supplying a condition persists the answer as policy for future
    /// requests (an empty condition persists it unconditionally). Absent
    /// means answer once, remember nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// What the confirmation surface sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptView {
    pub id: Uuid,
    pub host: String,
    pub operation_type: String,
    /// Operation parameters the user should review before answering, e.g.
    /// the event to sign or the tip amount and recipient.
    pub params: serde_json::Value,
    pub created_at: i64,
}

/// Push channel towards the confirmation surface. Polling `GET /v1/prompt`
/// always works; a surface may additionally register a webhook to be told
/// the moment a prompt opens.
#[async_trait]
pub trait PromptSurface: Send + Sync {
    async fn prompt_opened(&self, prompt: &PromptView);
}

pub struct NullPromptSurface;

#[async_trait]
impl PromptSurface for NullPromptSurface {
    async fn prompt_opened(&self, _prompt: &PromptView) {}
}

/// POSTs each new prompt to a configured endpoint. Delivery failures are
/// logged and otherwise ignored; the poll endpoint remains authoritative.
pub struct WebhookPromptSurface {
    client: reqwest::Client,
    url: Url,
}

impl WebhookPromptSurface {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl PromptSurface for WebhookPromptSurface {
    async fn prompt_opened(&self, prompt: &PromptView) {
        if let Err(e) = self
            .client
            .post(self.url.clone())
            .json(prompt)
            .send()
            .await
        {
            tracing::warn!(prompt_id = %prompt.id, error = %e, "Prompt webhook delivery failed");
        }
    }
}

struct PendingPrompt {
    view: PromptView,
    reply_tx: oneshot::Sender<PromptReply>,
}

/// Clears the prompt slot when the waiting future is abandoned before a
/// reply arrives.
struct SlotGuard<'a> {
    broker: &'a AuthBroker,
    id: Uuid,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!(prompt_id = %self.id, "Prompt abandoned before resolution");
            self.broker.clear_slot(self.id);
        }
    }
}

/// Guard for the in-flight operation. Dropping it releases the gate; hold
/// it until the reply's policy side effects are persisted.
pub struct OperationPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

pub struct AuthBroker {
    gate: Arc<Semaphore>,
    pending: Mutex<Option<PendingPrompt>>,
    surface: Arc<dyn PromptSurface>,
}

impl AuthBroker {
    pub fn new(surface: Arc<dyn PromptSurface>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            pending: Mutex::new(None),
            surface,
        }
    }

    /// Claim the single operation slot, or fail immediately.
    pub fn try_begin(&self) -> Result<OperationPermit, AgentError> {
        match self.gate.clone().try_acquire_owned() {
            Ok(permit) => Ok(OperationPermit { _permit: permit }),
            Err(_) => Err(AgentError::Busy),
        }
    }

    /// Open a prompt and wait for the user's answer.
    ///
    /// The caller must hold the [`OperationPermit`], so there is never more
    /// than one pending prompt. A dropped reply channel (surface closed the
    /// window without answering) counts as a denial. If the waiting future
    /// is itself dropped (caller disconnected), the slot is cleared so the
    /// surface never sees a prompt nobody is waiting on.
    pub async fn prompt(
        &self,
        host: &str,
        operation_type: &str,
        params: serde_json::Value,
    ) -> PromptReply {
        let view = PromptView {
            id: Uuid::new_v4(),
            host: host.to_string(),
            operation_type: operation_type.to_string(),
            params,
            created_at: Utc::now().timestamp(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("prompt slot lock poisoned");
            *pending = Some(PendingPrompt {
                view: view.clone(),
                reply_tx,
            });
        }
        let mut guard = SlotGuard {
            broker: self,
            id: view.id,
            armed: true,
        };
        tracing::info!(prompt_id = %view.id, host, operation_type, "Prompt opened");
        self.surface.prompt_opened(&view).await;

        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => {
                // Nobody can answer anymore; clear the slot ourselves.
                self.clear_slot(view.id);
                PromptReply {
                    accept: false,
                    condition: None,
                }
            }
        };
        guard.armed = false;
        reply
    }

    /// Remove the pending prompt if it is still the one with this id.
    fn clear_slot(&self, id: Uuid) {
        let mut pending = self.pending.lock().expect("prompt slot lock poisoned");
        if pending.as_ref().is_some_and(|p| p.view.id == id) {
            pending.take();
        }
    }

    /// The currently open prompt, if any.
    pub fn current_prompt(&self) -> Option<PromptView> {
        self.pending
            .lock()
            .expect("prompt slot lock poisoned")
            .as_ref()
            .map(|p| p.view.clone())
    }

    /// Deliver the user's answer for the prompt with this id.
    pub fn resolve(&self, id: Uuid, reply: PromptReply) -> Result<(), AgentError> {
        let mut pending = self.pending.lock().expect("prompt slot lock poisoned");
        match pending.as_ref() {
            Some(p) if p.view.id == id => {
                let p = pending.take().expect("checked above");
                // A lost receiver means the waiting operation went away; the
                // answer is then moot.
                let _ = p.reply_tx.send(reply);
                Ok(())
            }
            _ => Err(AgentError::NotFound(format!("no pending prompt {id}"))),
        }
    }

    /// Close the prompt without consent; equivalent to answering "deny"
    /// without remembering anything.
    pub fn dismiss(&self, id: Uuid) -> Result<(), AgentError> {
        self.resolve(
            id,
            PromptReply {
                accept: false,
                condition: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Arc<AuthBroker> {
        Arc::new(AuthBroker::new(Arc::new(NullPromptSurface)))
    }

    #[test]
    fn second_operation_is_busy_not_queued() {
        let broker = broker();
        let _held = broker.try_begin().unwrap();
        assert!(matches!(broker.try_begin(), Err(AgentError::Busy)));
    }

    #[test]
    fn permit_release_reopens_the_gate() {
        let broker = broker();
        drop(broker.try_begin().unwrap());
        assert!(broker.try_begin().is_ok());
    }

    #[tokio::test]
    async fn prompt_resolves_with_user_reply() {
        let broker = broker();
        let prompter = broker.clone();
        let task = tokio::spawn(async move {
            prompter
                .prompt("a.example", "signEvent", serde_json::json!({"kind": 1}))
                .await
        });

        // Wait for the prompt to appear, then answer it.
        let view = loop {
            if let Some(view) = broker.current_prompt() {
                break view;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(view.host, "a.example");

        broker
            .resolve(
                view.id,
                PromptReply {
                    accept: true,
                    condition: Some(Condition::default()),
                },
            )
            .unwrap();

        let reply = task.await.unwrap();
        assert!(reply.accept);
        assert!(broker.current_prompt().is_none());
    }

    #[tokio::test]
    async fn dismiss_is_a_denial() {
        let broker = broker();
        let prompter = broker.clone();
        let task = tokio::spawn(async move {
            prompter
                .prompt("a.example", "tip", serde_json::json!({"amountSat": 5000}))
                .await
        });

        let view = loop {
            if let Some(view) = broker.current_prompt() {
                break view;
            }
            tokio::task::yield_now().await;
        };
        broker.dismiss(view.id).unwrap();

        let reply = task.await.unwrap();
        assert!(!reply.accept);
        assert_eq!(reply.condition, None);
    }

    #[tokio::test]
    async fn abandoned_prompt_clears_the_slot() {
        let broker = broker();
        let prompter = broker.clone();
        let task = tokio::spawn(async move {
            prompter
                .prompt("a.example", "signEvent", serde_json::json!({"kind": 1}))
                .await
        });

        let view = loop {
            if let Some(view) = broker.current_prompt() {
                break view;
            }
            tokio::task::yield_now().await;
        };

        // The caller goes away without ever receiving an answer.
        task.abort();
        let _ = task.await;

        assert!(broker.current_prompt().is_none());
        let late = broker.resolve(
            view.id,
            PromptReply {
                accept: true,
                condition: None,
            },
        );
        assert!(matches!(late, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn resolving_unknown_id_is_not_found() {
        let broker = broker();
        let result = broker.resolve(
            Uuid::new_v4(),
            PromptReply {
                accept: true,
                condition: None,
            },
        );
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }
}
