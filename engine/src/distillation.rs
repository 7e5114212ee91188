//! Profile distillation.
//!
//! Analysis jobs are message-passed to a background worker. Each job is
//! distilled against the latest stored profile; the model's reply is
//! validated, given exactly one corrective retry, and persisted as a new
//! profile version. The worker never touches the ledger or the lock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mnemo_context::{
    SequenceGenerator, Store, StoreError, latest_profile, profile_record, validate_profile,
};
use mnemo_providers::{ChatMessage, GenerationRequest, Generator, ResponseMode};
use mnemo_types::{AnalysisJob, UserProfile};

use crate::errors::DistillError;
use crate::prompts::{RETRY_INSTRUCTION, distillation_messages};

pub struct Distiller<G> {
    store: Arc<dyn Store>,
    generator: Arc<G>,
    sequence: SequenceGenerator,
}

impl<G: Generator> Distiller<G> {
    pub fn new(store: Arc<dyn Store>, generator: Arc<G>) -> Self {
        Self {
            store,
            generator,
            sequence: SequenceGenerator::new(),
        }
    }

    /// Distill one job and persist the resulting profile.
    pub async fn distill(&self, job: &AnalysisJob) -> Result<UserProfile, DistillError> {
        let conversation = &job.conversation;
        let current = latest_profile(self.store.as_ref(), conversation)?;
        let mut messages =
            distillation_messages(&current, job.messages()).map_err(StoreError::from)?;

        let first = self.request(messages.clone(), job.response_budget).await?;
        let profile = match validate_profile(&first) {
            Ok(profile) => profile,
            Err(first_error) => {
                tracing::warn!(
                    conversation = %conversation,
                    error = %first_error,
                    "Distilled profile failed validation; retrying once"
                );
                messages.push(ChatMessage::assistant(first));
                messages.push(ChatMessage::user(RETRY_INSTRUCTION));

                let second = self.request(messages, job.response_budget).await?;
                validate_profile(&second).map_err(|e| DistillError::DistillationFailed {
                    reason: e.to_string(),
                })?
            }
        };

        let sequence = self.sequence.next_key();
        self.store
            .put(profile_record(conversation, &sequence, &profile))?;
        tracing::info!(
            conversation = %conversation,
            sequence = %sequence,
            messages = job.range.message_count(),
            "Profile updated"
        );
        Ok(profile)
    }

    async fn request(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<String, DistillError> {
        let request = GenerationRequest {
            messages,
            max_tokens,
            mode: ResponseMode::JsonObject,
        };
        Ok(self.generator.complete(request).await?)
    }
}

/// Start a worker that distills jobs in arrival order until every sender is
/// dropped.
pub fn spawn_worker<G>(distiller: Distiller<G>) -> (mpsc::UnboundedSender<AnalysisJob>, JoinHandle<()>)
where
    G: Generator + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<AnalysisJob>();
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = distiller.distill(&job).await {
                tracing::error!(
                    conversation = %job.conversation,
                    error = %e,
                    "Distillation failed; profile left unchanged"
                );
            }
        }
        tracing::debug!("Distillation worker stopped");
    });
    (tx, handle)
}
