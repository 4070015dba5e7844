use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use messaging_core::{
    bulk::Recipient,
    config::{apply_env_overrides, load_settings, load_settings_from},
    ClientEvent, DirectMessage, MessageTemplate, MessagingContext, SendOutcome,
};
use shared::domain::{ConversationId, JobId, UserId};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to $MESSAGING_CONFIG or messaging.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Send {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        job: Option<String>,
        content: String,
    },
    Bulk {
        /// JSON array of recipients.
        #[arg(long)]
        recipients: PathBuf,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    History {
        conversation: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    Listen {
        conversations: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => {
            let mut settings = load_settings_from(path);
            apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
            settings
        }
        None => load_settings(),
    };
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if cli.token.is_some() {
        settings.auth_token = cli.token;
    }

    let context = MessagingContext::build(settings).await?;
    context.start().await;
    wait_for_connection(&context).await;

    let outcome = run(&context, cli.command).await;
    context.shutdown().await;
    outcome
}

async fn wait_for_connection(context: &MessagingContext) {
    if context.settings().auth_token.is_none() {
        return;
    }
    let mut events = context.connection().subscribe_events();
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        if context.connection().is_connected().await {
            return;
        }
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::StatusChanged(status) if status.is_connected() => return,
                ClientEvent::ConnectionAbandoned { .. } => return,
                _ => {}
            }
        }
    })
    .await;
    if connected.is_err() {
        warn!("cli: not connected yet, messages will be queued");
    }
}

async fn run(context: &MessagingContext, command: Command) -> Result<()> {
    match command {
        Command::Send {
            conversation,
            recipient,
            subject,
            job,
            content,
        } => {
            let sent = context
                .messenger()
                .send_direct(DirectMessage {
                    conversation_id: ConversationId::new(conversation),
                    recipient_id: UserId::new(recipient),
                    subject,
                    content,
                    job_id: job.map(JobId::new),
                })
                .await?;
            let delivery = match sent.delivery {
                SendOutcome::Delivered(_) => "delivered live",
                SendOutcome::Queued => {
                    // Buffered frames do not survive shutdown.
                    context.queue().flush_all().await;
                    if context.queue().pending_channels().await.is_empty() {
                        "delivered live"
                    } else {
                        "persisted only, live delivery skipped"
                    }
                }
                SendOutcome::Dropped => "persisted only, live delivery skipped",
            };
            println!("stored message_id={} ({delivery})", sent.stored.id);
        }
        Command::Bulk {
            recipients,
            subject,
            body,
            batch_size,
        } => {
            let raw = tokio::fs::read_to_string(&recipients)
                .await
                .with_context(|| format!("reading {}", recipients.display()))?;
            let recipients: Vec<Recipient> = serde_json::from_str(&raw)?;
            let template = MessageTemplate { subject, body };

            let mut progress = context.bulk().subscribe_progress();
            let printer = tokio::spawn(async move {
                while let Ok(update) = progress.recv().await {
                    println!(
                        "{:?}: {}/{} sent, {} ok, {} failed",
                        update.phase,
                        update.processed,
                        update.total,
                        update.successful_count,
                        update.failed_count
                    );
                }
            });

            let batch_size = batch_size.unwrap_or_else(|| context.bulk().batch_size());
            let report = context
                .bulk()
                .send_bulk_with_batch_size(&recipients, &template, batch_size)
                .await?;
            printer.abort();

            println!(
                "bulk finished: {} successful, {} failed",
                report.successful.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!("  failed {}: {}", failure.recipient_id, failure.error);
            }
        }
        Command::History { conversation, page } => {
            let conversation_id = ConversationId::new(conversation);
            let loaded = context.messenger().load_page(&conversation_id, page).await?;
            for message in &loaded.messages {
                println!(
                    "[{}] {}: {}",
                    message.created_at.format("%Y-%m-%d %H:%M"),
                    message.sender_id,
                    message.content
                );
            }
            if loaded.has_more {
                println!("(more on page {})", loaded.page + 1);
            }
        }
        Command::Listen { conversations } => {
            let mut events = context.connection().subscribe_events();
            for conversation in conversations {
                context
                    .connection()
                    .join_conversation(&ConversationId::new(conversation))
                    .await;
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::ViewUpdated(view)) => {
                            println!("unread total={} online={}", view.total_unread(), view.online_users.len());
                        }
                        Ok(ClientEvent::StatusChanged(status)) => println!("status: {status:?}"),
                        Ok(ClientEvent::ConnectionAbandoned { attempts }) => {
                            println!("connection abandoned after {attempts} attempts");
                            break;
                        }
                        Ok(ClientEvent::Error(message)) => println!("error: {message}"),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}
