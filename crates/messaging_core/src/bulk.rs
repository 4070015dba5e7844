use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, JobId, UserId},
    protocol::StoredMessage,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::BulkSendError;

pub const DEFAULT_NAME: &str = "Candidate";
pub const DEFAULT_POSITION: &str = "the position";
pub const DEFAULT_COMPANY_NAME: &str = "our company";
pub const DEFAULT_STRENGTHS: &str = "qualifications";
pub const DEFAULT_INTERVIEW_LINK: &str = "[interview link]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub recipient_id: UserId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub interview_link: Option<String>,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub fn render_template(template: &MessageTemplate, recipient: &Recipient) -> RenderedMessage {
    let strengths = if recipient.strengths.is_empty() {
        DEFAULT_STRENGTHS.to_string()
    } else {
        recipient.strengths.join(", ")
    };
    let values = [
        ("{name}", non_empty(&recipient.name, DEFAULT_NAME)),
        ("{position}", non_empty(&recipient.position, DEFAULT_POSITION)),
        (
            "{companyName}",
            non_empty(&recipient.company_name, DEFAULT_COMPANY_NAME),
        ),
        ("{strengths}", strengths.as_str()),
        (
            "{interviewLink}",
            non_empty(&recipient.interview_link, DEFAULT_INTERVIEW_LINK),
        ),
    ];
    let fill = |text: &str| {
        values
            .iter()
            .fold(text.to_string(), |acc, (token, value)| acc.replace(token, value))
    };
    RenderedMessage {
        subject: fill(&template.subject),
        body: fill(&template.body),
    }
}

fn non_empty<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    match value.as_deref() {
        Some(value) if !value.trim().is_empty() => value,
        _ => default,
    }
}

#[async_trait]
pub trait RecipientSender: Send + Sync {
    /// Checked once before the first batch; an error aborts the whole run.
    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> anyhow::Result<StoredMessage>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageResult {
    pub recipient_id: UserId,
    pub message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecipient {
    pub recipient_id: UserId,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPhase {
    Sending,
    Retrying,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkProgress {
    pub phase: BulkPhase,
    pub processed: usize,
    pub total: usize,
    pub successful_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSendReport {
    pub successful: Vec<MessageResult>,
    pub failed: Vec<FailedRecipient>,
    pub first_pass_failed: Vec<FailedRecipient>,
}

#[derive(Default)]
struct BatchOutcome<'a> {
    successful: Vec<MessageResult>,
    failed: Vec<(&'a Recipient, String)>,
}

fn to_failures(failed: &[(&Recipient, String)]) -> Vec<FailedRecipient> {
    failed
        .iter()
        .map(|(recipient, error)| FailedRecipient {
            recipient_id: recipient.recipient_id.clone(),
            error: error.clone(),
        })
        .collect()
}

pub struct BulkSendOrchestrator {
    sender: Arc<dyn RecipientSender>,
    batch_size: usize,
    progress: broadcast::Sender<BulkProgress>,
}

impl BulkSendOrchestrator {
    pub fn new(sender: Arc<dyn RecipientSender>, batch_size: usize) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            sender,
            batch_size,
            progress,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<BulkProgress> {
        self.progress.subscribe()
    }

    pub async fn send_bulk(
        &self,
        recipients: &[Recipient],
        template: &MessageTemplate,
    ) -> Result<BulkSendReport, BulkSendError> {
        self.send_bulk_with_batch_size(recipients, template, self.batch_size)
            .await
    }

    pub async fn send_bulk_with_batch_size(
        &self,
        recipients: &[Recipient],
        template: &MessageTemplate,
        batch_size: usize,
    ) -> Result<BulkSendReport, BulkSendError> {
        if batch_size == 0 {
            return Err(BulkSendError::InvalidBatchSize);
        }
        self.sender
            .ready()
            .await
            .map_err(|err| BulkSendError::Unavailable(format!("{err:#}")))?;

        let total = recipients.len();
        info!(total, batch_size, "bulk: starting");
        let mut successful = Vec::with_capacity(total);
        let mut failed: Vec<(&Recipient, String)> = Vec::new();
        let mut processed = 0;

        for (index, batch) in recipients.chunks(batch_size).enumerate() {
            let outcome = self.send_batch(batch.iter(), template).await;
            processed += batch.len();
            successful.extend(outcome.successful);
            failed.extend(outcome.failed);
            info!(
                batch = index + 1,
                processed,
                total,
                failed = failed.len(),
                "bulk: batch settled"
            );
            self.publish(BulkPhase::Sending, processed, total, successful.len(), failed.len());
        }

        let first_pass_failed = to_failures(&failed);
        if !failed.is_empty() {
            warn!(count = failed.len(), "bulk: retrying failed recipients once");
            self.publish(BulkPhase::Retrying, processed, total, successful.len(), failed.len());
            let retry_targets = std::mem::take(&mut failed)
                .into_iter()
                .map(|(recipient, _)| recipient);
            let outcome = self.send_batch(retry_targets, template).await;
            successful.extend(outcome.successful);
            failed = outcome.failed;
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), "bulk: recipients failed permanently");
        }
        info!(
            successful = successful.len(),
            failed = failed.len(),
            "bulk: finished"
        );
        self.publish(BulkPhase::Finished, processed, total, successful.len(), failed.len());

        Ok(BulkSendReport {
            successful,
            failed: to_failures(&failed),
            first_pass_failed,
        })
    }

    async fn send_batch<'a>(
        &self,
        batch: impl Iterator<Item = &'a Recipient>,
        template: &MessageTemplate,
    ) -> BatchOutcome<'a> {
        let sends = batch.map(|recipient| async move {
            let rendered = render_template(template, recipient);
            (recipient, self.sender.send(recipient, &rendered).await)
        });

        let mut outcome = BatchOutcome::default();
        for (recipient, result) in join_all(sends).await {
            match result {
                Ok(message) => outcome.successful.push(MessageResult {
                    recipient_id: recipient.recipient_id.clone(),
                    message,
                }),
                Err(err) => outcome.failed.push((recipient, format!("{err:#}"))),
            }
        }
        outcome
    }

    fn publish(
        &self,
        phase: BulkPhase,
        processed: usize,
        total: usize,
        successful_count: usize,
        failed_count: usize,
    ) {
        let _ = self.progress.send(BulkProgress {
            phase,
            processed,
            total,
            successful_count,
            failed_count,
        });
    }
}

#[cfg(test)]
#[path = "tests/bulk_tests.rs"]
mod tests;
