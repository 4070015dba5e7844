use super::*;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use shared::domain::MessageId;

#[derive(Default)]
struct ScriptedSender {
    /// Recipient ids that fail this many times before succeeding.
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, RenderedMessage)>>,
    in_flight: Mutex<(usize, usize)>,
    latency: Duration,
    unavailable: bool,
}

impl ScriptedSender {
    fn failing(failures: &[(&str, u32)]) -> Self {
        Self {
            failures: Mutex::new(
                failures
                    .iter()
                    .map(|(id, count)| (id.to_string(), *count))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(recipient, _)| recipient == id)
            .count()
    }

    fn max_concurrency(&self) -> usize {
        self.in_flight.lock().expect("in flight").1
    }
}

#[async_trait]
impl RecipientSender for ScriptedSender {
    async fn ready(&self) -> anyhow::Result<()> {
        if self.unavailable {
            return Err(anyhow!("socket abandoned"));
        }
        Ok(())
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> anyhow::Result<StoredMessage> {
        let id = recipient.recipient_id.to_string();
        self.calls
            .lock()
            .expect("calls")
            .push((id.clone(), message.clone()));
        {
            let mut in_flight = self.in_flight.lock().expect("in flight");
            in_flight.0 += 1;
            in_flight.1 = in_flight.1.max(in_flight.0);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.lock().expect("in flight").0 -= 1;

        let should_fail = {
            let mut failures = self.failures.lock().expect("failures");
            match failures.get_mut(&id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(anyhow!("delivery to {id} failed"));
        }
        Ok(StoredMessage {
            id: MessageId::new(format!("msg-{id}")),
            conversation_id: recipient.conversation_id.clone(),
            sender_id: UserId::new("employer"),
            recipient_id: Some(recipient.recipient_id.clone()),
            subject: Some(message.subject.clone()),
            content: message.body.clone(),
            job_id: recipient.job_id.clone(),
            client_message_id: None,
            read: false,
            created_at: Utc::now(),
        })
    }
}

fn recipients(count: usize) -> Vec<Recipient> {
    (1..=count)
        .map(|i| Recipient {
            recipient_id: UserId::new(format!("r{i}")),
            conversation_id: ConversationId::new(format!("c{i}")),
            name: Some(format!("Name {i}")),
            position: None,
            company_name: None,
            strengths: Vec::new(),
            interview_link: None,
            job_id: None,
        })
        .collect()
}

fn template() -> MessageTemplate {
    MessageTemplate {
        subject: "Update for {name}".into(),
        body: "Hi {name}, thanks for applying to {position}.".into(),
    }
}

fn ids(results: &[MessageResult]) -> Vec<String> {
    results.iter().map(|r| r.recipient_id.to_string()).collect()
}

#[tokio::test]
async fn partial_failure_is_retried_once() {
    // r3 recovers on retry, r7 keeps failing.
    let sender = Arc::new(ScriptedSender::failing(&[("r3", 1), ("r7", 5)]));
    let orchestrator = BulkSendOrchestrator::new(sender.clone(), 10);

    let report = orchestrator
        .send_bulk(&recipients(10), &template())
        .await
        .expect("bulk send");

    assert_eq!(report.first_pass_failed.len(), 2);
    assert_eq!(report.successful.len(), 9);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].recipient_id, UserId::new("r7"));
    assert!(report.failed[0].error.contains("r7"));
    assert!(ids(&report.successful).contains(&"r3".to_string()));

    assert_eq!(sender.calls_for("r3"), 2);
    assert_eq!(sender.calls_for("r7"), 2);
    assert_eq!(sender.calls_for("r1"), 1);
}

#[tokio::test]
async fn clean_run_skips_retry_pass() {
    let sender = Arc::new(ScriptedSender::default());
    let orchestrator = BulkSendOrchestrator::new(sender.clone(), 4);
    let mut progress = orchestrator.subscribe_progress();

    let report = orchestrator
        .send_bulk(&recipients(5), &template())
        .await
        .expect("bulk send");

    assert_eq!(report.successful.len(), 5);
    assert!(report.failed.is_empty());
    assert!(report.first_pass_failed.is_empty());
    assert_eq!(sender.calls.lock().expect("calls").len(), 5);

    let mut phases = Vec::new();
    while let Ok(update) = progress.try_recv() {
        phases.push(update.phase);
    }
    assert_eq!(
        phases,
        vec![BulkPhase::Sending, BulkPhase::Sending, BulkPhase::Finished]
    );
}

#[tokio::test]
async fn progress_is_reported_after_each_batch() {
    let sender = Arc::new(ScriptedSender::failing(&[("r2", 1)]));
    let orchestrator = BulkSendOrchestrator::new(sender, 2);
    let mut progress = orchestrator.subscribe_progress();

    orchestrator
        .send_bulk(&recipients(5), &template())
        .await
        .expect("bulk send");

    let mut updates = Vec::new();
    while let Ok(update) = progress.try_recv() {
        updates.push(update);
    }
    let sending: Vec<_> = updates
        .iter()
        .filter(|u| u.phase == BulkPhase::Sending)
        .map(|u| (u.processed, u.successful_count, u.failed_count))
        .collect();
    assert_eq!(sending, vec![(2, 1, 1), (4, 3, 1), (5, 4, 1)]);
    assert!(updates.iter().all(|u| u.total == 5));

    let last = updates.last().expect("final update");
    assert_eq!(last.phase, BulkPhase::Finished);
    assert_eq!((last.successful_count, last.failed_count), (5, 0));
}

#[tokio::test(start_paused = true)]
async fn sends_within_a_batch_run_concurrently() {
    let sender = Arc::new(ScriptedSender {
        latency: Duration::from_millis(100),
        ..ScriptedSender::default()
    });
    let orchestrator = BulkSendOrchestrator::new(sender.clone(), 3);

    let started = tokio::time::Instant::now();
    orchestrator
        .send_bulk(&recipients(7), &template())
        .await
        .expect("bulk send");

    // Three batches, each settling in one latency period.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(400));
    assert_eq!(sender.max_concurrency(), 3);
}

#[tokio::test]
async fn unavailable_sender_fails_before_any_batch() {
    let sender = Arc::new(ScriptedSender {
        unavailable: true,
        ..ScriptedSender::default()
    });
    let orchestrator = BulkSendOrchestrator::new(sender.clone(), 10);

    let err = orchestrator
        .send_bulk(&recipients(3), &template())
        .await
        .expect_err("unavailable");

    assert!(matches!(err, BulkSendError::Unavailable(reason) if reason.contains("abandoned")));
    assert!(sender.calls.lock().expect("calls").is_empty());
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let orchestrator = BulkSendOrchestrator::new(Arc::new(ScriptedSender::default()), 10);
    let err = orchestrator
        .send_bulk_with_batch_size(&recipients(1), &template(), 0)
        .await
        .expect_err("invalid");
    assert!(matches!(err, BulkSendError::InvalidBatchSize));
}

#[tokio::test]
async fn empty_recipient_list_reports_nothing() {
    let sender = Arc::new(ScriptedSender::default());
    let orchestrator = BulkSendOrchestrator::new(sender, 10);
    let report = orchestrator
        .send_bulk(&[], &template())
        .await
        .expect("bulk send");
    assert_eq!(report, BulkSendReport::default());
}

#[tokio::test]
async fn each_recipient_gets_their_own_rendering() {
    let sender = Arc::new(ScriptedSender::default());
    let orchestrator = BulkSendOrchestrator::new(sender.clone(), 10);
    orchestrator
        .send_bulk(&recipients(2), &template())
        .await
        .expect("bulk send");

    let calls = sender.calls.lock().expect("calls");
    let subjects: HashSet<_> = calls.iter().map(|(_, m)| m.subject.clone()).collect();
    assert_eq!(
        subjects,
        HashSet::from(["Update for Name 1".to_string(), "Update for Name 2".to_string()])
    );
}

#[test]
fn template_fills_all_tokens() {
    let recipient = Recipient {
        recipient_id: UserId::new("r1"),
        conversation_id: ConversationId::new("c1"),
        name: Some("Ada".into()),
        position: Some("Backend Engineer".into()),
        company_name: Some("Acme".into()),
        strengths: vec!["Rust".into(), "distributed systems".into()],
        interview_link: Some("https://meet.example/ada".into()),
        job_id: Some(JobId::new("j1")),
    };
    let template = MessageTemplate {
        subject: "{position} at {companyName}".into(),
        body: "Dear {name}, your {strengths} stood out. Book here: {interviewLink}. {name}!".into(),
    };

    let rendered = render_template(&template, &recipient);

    assert_eq!(rendered.subject, "Backend Engineer at Acme");
    assert_eq!(
        rendered.body,
        "Dear Ada, your Rust, distributed systems stood out. Book here: https://meet.example/ada. Ada!"
    );
}

#[test]
fn template_uses_defaults_for_missing_values() {
    let recipient = Recipient {
        recipient_id: UserId::new("r1"),
        conversation_id: ConversationId::new("c1"),
        name: Some("  ".into()),
        position: None,
        company_name: None,
        strengths: Vec::new(),
        interview_link: None,
        job_id: None,
    };
    let template = MessageTemplate {
        subject: "{name}".into(),
        body: "{position}|{companyName}|{strengths}|{interviewLink}|{unknown}".into(),
    };

    let rendered = render_template(&template, &recipient);

    assert_eq!(rendered.subject, DEFAULT_NAME);
    assert_eq!(
        rendered.body,
        "the position|our company|qualifications|[interview link]|{unknown}"
    );
}

#[test]
fn recipients_deserialize_from_camel_case() {
    let recipient: Recipient = serde_json::from_str(
        r#"{"recipientId":"u1","conversationId":"c1","companyName":"Acme","strengths":["Go"]}"#,
    )
    .expect("recipient");
    assert_eq!(recipient.company_name.as_deref(), Some("Acme"));
    assert_eq!(recipient.strengths, vec!["Go".to_string()]);
    assert!(recipient.name.is_none());
}
