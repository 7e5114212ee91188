//! The turn orchestrator.
//!
//! A turn runs strictly in order:
//!
//! 1. validate input and budgets
//! 2. load the ledger and take the idempotency lock (persisted immediately)
//! 3. load both windows and reconcile them with the current budgets
//! 4. stream the reply to the transport sink
//! 5. admit the new pair to the chat window and offer it to the analysis window
//! 6. persist the ledger (unlocked) and both messages in one conditional batch
//! 7. hand any analysis jobs to the distillation worker
//!
//! Any failure after step 2 releases the lock before the error is returned.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use mnemo_context::{
    Condition, IdempotencyLock, SequenceGenerator, Store, StoreError, TokenCounter, Write,
    admit_pair, apply_pair, latest_profile, ledger_record, load_ledger, load_windows,
    message_record, reconcile,
};
use mnemo_providers::{
    ChatMessage, GenerationError, GenerationRequest, Generator, ResponseMode, StreamEvent,
};
use mnemo_types::{
    AnalysisJob, ContextWindowMeta, ConversationKey, LockState, Role, StoredMessage, TokenLengths,
    WindowBudgets,
};

use crate::errors::TurnError;
use crate::prompts::chat_messages;
use crate::sink::{TransportEvent, TransportSink};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation: ConversationKey,
    pub text: String,
    /// Distill the analysis window this turn regardless of its size.
    pub force_distill: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResponse {
    pub status: u16,
    /// The reply on success, otherwise a description of the failure.
    pub message: String,
}

impl TurnResponse {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: 200,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

impl From<&TurnError> for TurnResponse {
    fn from(error: &TurnError) -> Self {
        Self {
            status: error.status(),
            message: error.to_string(),
        }
    }
}

pub struct Pipeline<G> {
    store: Arc<dyn Store>,
    generator: Arc<G>,
    budgets: WindowBudgets,
    lock: IdempotencyLock,
    counter: TokenCounter,
    sequence: SequenceGenerator,
    jobs: mpsc::UnboundedSender<AnalysisJob>,
}

impl<G: Generator> Pipeline<G> {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<G>,
        budgets: WindowBudgets,
        jobs: mpsc::UnboundedSender<AnalysisJob>,
    ) -> Self {
        Self {
            store,
            generator,
            budgets,
            lock: IdempotencyLock::default(),
            counter: TokenCounter::new(),
            sequence: SequenceGenerator::new(),
            jobs,
        }
    }

    #[must_use]
    pub fn with_lock(mut self, lock: IdempotencyLock) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub const fn budgets(&self) -> &WindowBudgets {
        &self.budgets
    }

    /// Run one turn and report it as a status plus message.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &mut dyn TransportSink,
    ) -> TurnResponse {
        let conversation = request.conversation.clone();
        match self.turn(request, sink).await {
            Ok(reply) => TurnResponse::ok(reply),
            Err(e) => {
                match e {
                    TurnError::InvalidInput(_) | TurnError::LockContention => {
                        tracing::info!(conversation = %conversation, error = %e, "Turn rejected");
                    }
                    TurnError::Storage(_) | TurnError::Upstream(_) => {
                        tracing::error!(conversation = %conversation, error = %e, "Turn failed");
                    }
                }
                TurnResponse::from(&e)
            }
        }
    }

    /// Run one turn, returning the reply text.
    pub async fn turn(
        &self,
        request: TurnRequest,
        sink: &mut dyn TransportSink,
    ) -> Result<String, TurnError> {
        self.budgets.validate()?;
        let TurnRequest {
            conversation,
            text,
            force_distill,
        } = request;
        let user_lengths = self.check_input(&text, force_distill)?;

        let store = self.store.as_ref();
        let loaded = load_ledger(store, &conversation, &self.budgets)?;
        let holder = Uuid::new_v4().to_string();
        let locked = self.lock.try_acquire(
            store,
            &conversation,
            loaded,
            &holder,
            Utc::now().timestamp_millis(),
        )?;

        let result = self
            .locked_turn(&conversation, text, user_lengths, force_distill, &locked, sink)
            .await;
        if result.is_err()
            && let Err(e) = self.lock.release(store, &conversation, &locked)
        {
            tracing::error!(
                conversation = %conversation,
                error = %e,
                "Failed to release lock after failed turn; it will expire with its lease"
            );
        }
        result
    }

    /// Measure the user text. `None` means an empty forced flush.
    fn check_input(&self, text: &str, force: bool) -> Result<Option<TokenLengths>, TurnError> {
        if text.trim().is_empty() {
            return if force {
                Ok(None)
            } else {
                Err(TurnError::InvalidInput("Message is empty".to_string()))
            };
        }

        let lengths = self.counter.lengths(text, &self.budgets.metrics());
        let limits = [
            (self.budgets.chat.metric, self.budgets.chat.user_message),
            (self.budgets.analysis.metric, self.budgets.analysis.user_message),
        ];
        for (metric, limit) in limits {
            let length = lengths.get(&metric).copied().unwrap_or(0);
            if length > limit {
                return Err(TurnError::InvalidInput(format!(
                    "Message is too long: {length} {metric} tokens, limit is {limit}"
                )));
            }
        }
        Ok(Some(lengths))
    }

    async fn locked_turn(
        &self,
        conversation: &ConversationKey,
        text: String,
        user_lengths: Option<TokenLengths>,
        force: bool,
        locked: &ContextWindowMeta,
        sink: &mut dyn TransportSink,
    ) -> Result<String, TurnError> {
        let store = self.store.as_ref();
        let mut meta = locked.clone();
        let mut windows = load_windows(
            store,
            conversation,
            &mut meta,
            &self.budgets.metrics(),
            &self.counter,
        )?;
        let reconciliation = reconcile(&mut meta, &mut windows, &self.budgets, &self.counter);

        let (reply, pair) = if let Some(user_lengths) = user_lengths {
            let profile = latest_profile(store, conversation)?;
            let messages =
                chat_messages(&profile, &windows.chat, &text).map_err(StoreError::from)?;
            let reply = self.generate(messages, sink).await?;
            let pair = self.stored_pair(conversation, text, user_lengths, &reply);
            (reply, Some(pair))
        } else {
            tracing::info!(conversation = %conversation, "Empty forced turn; flushing analysis window");
            sink.deliver(TransportEvent::complete());
            (String::new(), None)
        };

        if let Some(pair) = &pair {
            let evicted = admit_pair(&mut windows.chat, &mut meta.chat, pair.clone());
            if evicted > 0 {
                tracing::debug!(conversation = %conversation, evicted, "Chat window evicted");
            }
        }
        let outcome = apply_pair(
            &mut windows.analysis,
            &mut meta.analysis,
            pair.clone(),
            reconciliation.overflow,
            force,
            conversation,
            self.budgets.analysis.batch_ceiling(),
            self.budgets.analysis.response,
        );

        let synced = self.sync(conversation, locked, meta, pair.as_ref())?;
        tracing::info!(
            conversation = %conversation,
            version = synced.version,
            chat_tokens = synced.chat.token_length,
            chat_messages = synced.chat.message_count,
            analysis_tokens = synced.analysis.token_length,
            analysis_messages = synced.analysis.message_count,
            "Turn complete"
        );

        self.dispatch(outcome.jobs);
        Ok(reply)
    }

    /// Stream a reply, forwarding each fragment to `sink` as it arrives.
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        sink: &mut dyn TransportSink,
    ) -> Result<String, TurnError> {
        let request = GenerationRequest {
            messages,
            max_tokens: self.budgets.chat.response,
            mode: ResponseMode::Text,
        };
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);

        let forward = async {
            let mut reply = String::new();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::TextDelta(text) => {
                        reply.push_str(&text);
                        sink.deliver(TransportEvent::partial(text));
                    }
                    StreamEvent::Done => return Ok(reply),
                    StreamEvent::Error(message) => return Err(GenerationError::Stream(message)),
                }
            }
            Err(GenerationError::Stream(
                "stream ended without completing".to_string(),
            ))
        };

        let (produced, forwarded) = tokio::join!(self.generator.stream(request, tx), forward);
        produced?;
        let reply = forwarded?;
        if reply.trim().is_empty() {
            return Err(GenerationError::EmptyCompletion.into());
        }
        sink.deliver(TransportEvent::complete());
        Ok(reply)
    }

    fn stored_pair(
        &self,
        conversation: &ConversationKey,
        text: String,
        user_lengths: TokenLengths,
        reply: &str,
    ) -> [StoredMessage; 2] {
        let user = StoredMessage {
            content: text,
            role: Role::User,
            token_lengths: user_lengths,
            conversation: conversation.clone(),
            sequence: self.sequence.next_key(),
        };
        let assistant = StoredMessage {
            content: reply.to_string(),
            role: Role::Assistant,
            token_lengths: self.counter.lengths(reply, &self.budgets.metrics()),
            conversation: conversation.clone(),
            sequence: self.sequence.next_key(),
        };
        [user, assistant]
    }

    /// Write the unlocked ledger and the new messages in one atomic batch.
    ///
    /// The ledger write is conditioned on the version this turn locked, so a
    /// lock reclaimed by another turn after lease expiry fails the batch.
    fn sync(
        &self,
        conversation: &ConversationKey,
        locked: &ContextWindowMeta,
        meta: ContextWindowMeta,
        pair: Option<&[StoredMessage; 2]>,
    ) -> Result<ContextWindowMeta, StoreError> {
        let synced = ContextWindowMeta {
            version: locked.version + 1,
            lock: LockState::Unlocked,
            ..meta
        };
        let mut writes = vec![Write {
            record: ledger_record(conversation, &synced),
            condition: Condition::IfVersion(locked.version),
        }];
        writes.extend(pair.into_iter().flatten().map(|message| Write {
            record: message_record(message),
            condition: Condition::IfAbsent,
        }));
        self.store.write_batch(writes)?;
        Ok(synced)
    }

    fn dispatch(&self, jobs: Vec<AnalysisJob>) {
        for job in jobs {
            if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
                tracing::warn!(
                    conversation = %job.conversation,
                    messages = job.range.message_count(),
                    "Distillation worker unavailable; dropping analysis job"
                );
            }
        }
    }
}
