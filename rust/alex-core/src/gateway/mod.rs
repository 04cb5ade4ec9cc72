//! The Channel Gateway State Machine: per-chat foreground-turn gating,
//! external-input relay, and admission for chat-driven task submission.
//!
//! The slot-map + TTL-sweep pattern here is a `HashMap`-under-lock registry,
//! the same idiom the scheduler's job registry uses. The state machine is
//! explicitly process-local, so its maps live behind `parking_lot` locks
//! rather than a shared store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bounded::BoundedTtlMap;
use crate::events::event_type;
use crate::execution::{SubmitRequest, TaskExecutionService};

/// Outbound message transport, injected. No real channel SDK is implemented
/// here per the non-goal; `RecordingMessenger` below is the test double.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: &str, content: &str, reply_to: Option<&str>) -> anyhow::Result<()>;
}

/// In-memory `Messenger` used by this module's own tests.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingMessenger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<(String, String, Option<String>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, chat_id: &str, content: &str, reply_to: Option<&str>) -> anyhow::Result<()> {
        self.sent.lock().push((chat_id.to_string(), content.to_string(), reply_to.map(str::to_string)));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    ForegroundRunning,
    AwaitingExternalInput,
}

struct ChatSlot {
    state: SlotState,
    current_run_id: Option<String>,
    pending_external_inputs: VecDeque<String>,
}

impl ChatSlot {
    fn new() -> Self {
        Self { state: SlotState::Idle, current_run_id: None, pending_external_inputs: VecDeque::new() }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub chat_slot_ttl: Duration,
    pub chat_dedup_ttl: Duration,
    pub pending_input_capacity: usize,
    pub command_global_cap: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            chat_slot_ttl: Duration::from_secs(60 * 60),
            chat_dedup_ttl: Duration::from_secs(5 * 60),
            pending_input_capacity: 16,
            command_global_cap: 8,
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    DuplicateDropped,
    TaskSubmitted,
    RelayedToPendingInput,
    RelayedToAwaitingInput,
    RejectedBusy,
    RejectedOverloaded,
}

/// Per-chat foreground-turn gate, external-input relay, and admission.
pub struct ChannelGatewayStateMachine {
    execution: Arc<TaskExecutionService>,
    messenger: Arc<dyn Messenger>,
    slots: Mutex<BoundedTtlMap<String, ChatSlot>>,
    dedup: Mutex<BoundedTtlMap<String, ()>>,
    command_slots: Arc<tokio::sync::Semaphore>,
    config: GatewayConfig,
}

impl ChannelGatewayStateMachine {
    #[must_use]
    pub fn new(execution: Arc<TaskExecutionService>, messenger: Arc<dyn Messenger>, config: GatewayConfig) -> Self {
        Self {
            execution,
            messenger,
            slots: Mutex::new(BoundedTtlMap::new(8192, config.chat_slot_ttl)),
            dedup: Mutex::new(BoundedTtlMap::new(8192, config.chat_dedup_ttl)),
            command_slots: Arc::new(tokio::sync::Semaphore::new(config.command_global_cap)),
            config,
        }
    }

    /// Handle one inbound message `message_id` with `content` for `chat_id`,
    /// mapped into session `session_id` for task submission.
    pub async fn on_message(
        self: &Arc<Self>,
        chat_id: &str,
        message_id: &str,
        session_id: &str,
        content: serde_json::Value,
        is_command: bool,
    ) -> MessageOutcome {
        let dedup_key = format!("{chat_id}:{message_id}");
        {
            let mut dedup = self.dedup.lock();
            if dedup.contains(&dedup_key) {
                return MessageOutcome::DuplicateDropped;
            }
            dedup.insert(dedup_key, ());
        }

        let mut slots = self.slots.lock();
        let slot = slots.get_or_insert_with(chat_id.to_string(), ChatSlot::new);

        match slot.state {
            SlotState::Idle => {
                drop(slots);
                self.try_admit(chat_id, session_id, content, is_command).await
            }
            SlotState::ForegroundRunning => {
                if slot.pending_external_inputs.len() < self.config.pending_input_capacity {
                    slot.pending_external_inputs.push_back(content.to_string());
                    MessageOutcome::RelayedToPendingInput
                } else {
                    drop(slots);
                    let _ = self.messenger.send(chat_id, "busy, please try again shortly", Some(message_id)).await;
                    MessageOutcome::RejectedBusy
                }
            }
            SlotState::AwaitingExternalInput => {
                slot.pending_external_inputs.push_back(content.to_string());
                slot.state = SlotState::ForegroundRunning;
                MessageOutcome::RelayedToAwaitingInput
            }
        }
    }

    async fn try_admit(
        self: &Arc<Self>,
        chat_id: &str,
        session_id: &str,
        content: serde_json::Value,
        is_command: bool,
    ) -> MessageOutcome {
        let command_permit = if is_command {
            match Arc::clone(&self.command_slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let _ = self.messenger.send(chat_id, "too many commands in flight, try again shortly", None).await;
                    return MessageOutcome::RejectedOverloaded;
                }
            }
        } else {
            None
        };

        let submission = self
            .execution
            .submit(SubmitRequest {
                session_id: session_id.to_string(),
                parent_run_id: None,
                request: content,
                idempotency_key: None,
            })
            .await;

        let Ok(response) = submission else {
            drop(command_permit);
            let _ = self.messenger.send(chat_id, "could not start task right now, try again shortly", None).await;
            return MessageOutcome::RejectedOverloaded;
        };

        {
            let mut slots = self.slots.lock();
            let slot = slots.get_or_insert_with(chat_id.to_string(), ChatSlot::new);
            slot.state = SlotState::ForegroundRunning;
            slot.current_run_id = Some(response.run_id.clone());
        }

        self.spawn_terminal_watch(chat_id.to_string(), session_id.to_string(), response.run_id, command_permit);
        MessageOutcome::TaskSubmitted
    }

    /// Watch the broadcaster for the terminal event of `run_id` and return
    /// the slot to `idle`, draining any unconsumed pending inputs with a
    /// user-visible notice.
    fn spawn_terminal_watch(
        self: &Arc<Self>,
        chat_id: String,
        session_id: String,
        run_id: String,
        command_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let broadcaster = this.execution_broadcaster();
            let mut handle = broadcaster.subscribe(&session_id);
            // Terminal events are delivered on the priority channel, never
            // the bounded data channel, so this has to watch both.
            loop {
                let event = tokio::select! {
                    biased;
                    event = handle.priority_receiver.recv() => event,
                    event = handle.receiver.recv() => event,
                };
                match event {
                    Some(event) if event.run_id == run_id && event.is_terminal() => break,
                    Some(_) => {}
                    None => break,
                }
            }
            broadcaster.unsubscribe(&handle.subscriber_id);
            drop(command_permit);
            this.on_run_terminal(&chat_id).await;
        });
    }

    fn execution_broadcaster(&self) -> Arc<crate::broadcaster::EventBroadcaster> {
        self.execution.broadcaster()
    }

    async fn on_run_terminal(&self, chat_id: &str) {
        let drained: Vec<String> = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&chat_id.to_string()) else { return };
            slot.state = SlotState::Idle;
            slot.current_run_id = None;
            std::mem::take(&mut slot.pending_external_inputs).into_iter().collect()
        };
        if !drained.is_empty() {
            info!(chat_id, count = drained.len(), "draining stale pending inputs after terminal");
            let _ = self.messenger.send(chat_id, "that task has finished; your message was not processed", None).await;
        }
    }

    /// Scheduler-originated submission: bypasses the chat slot machinery
    /// entirely, used by the scheduler's `tick()`.
    pub async fn submit_scheduler_task(
        &self,
        session_id: &str,
        request: serde_json::Value,
    ) -> Result<String, crate::error::AppError> {
        let resp = self
            .execution
            .submit(SubmitRequest { session_id: session_id.to_string(), parent_run_id: None, request, idempotency_key: None })
            .await?;
        Ok(resp.run_id)
    }

    /// Periodic sweep of the slot and dedup maps.
    pub fn prune(&self) {
        let pruned_slots = self.slots.lock().prune();
        let pruned_dedup = self.dedup.lock().prune();
        if pruned_slots + pruned_dedup > 0 {
            info!(pruned_slots, pruned_dedup, "gateway bounded-map sweep");
        }
    }

    #[must_use]
    pub fn active_chat_count(&self) -> usize {
        self.slots.lock().len()
    }
}
