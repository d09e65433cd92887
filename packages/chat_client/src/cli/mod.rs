pub mod tail;

use anyhow::{Context, Result};
use chat_client::{ClientConfig, RestHistoryClient, WsChannelFactory};
use chat_sync::{ConversationId, ConversationKind, Session, SyncClient, SyncError};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use tail::{InputLine, ViewPrinter};

/// Follow one conversation until stdin closes or `/quit`.
pub async fn tail_command(
    config: &ClientConfig,
    session: Session,
    conversation: ConversationId,
) -> Result<()> {
    let (session_tx, session_rx) = watch::channel(Some(session));
    let history = Arc::new(
        RestHistoryClient::new(&config.transport)?.with_sessions(session_rx.clone()),
    );
    let factory = Arc::new(WsChannelFactory::new(config.transport.clone()));
    let (handle, task) = SyncClient::spawn(config.sync.clone(), factory, history, session_rx);

    info!(conversation = %conversation, "Following conversation");
    handle.activate(Some(conversation)).await?;

    let mut views = handle.subscribe_view();
    let mut printer = ViewPrinter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                for line in printer.render(&view) {
                    println!("{line}");
                }
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match tail::parse_line(&line) {
                    InputLine::Empty => {}
                    InputLine::Quit => break,
                    InputLine::Attach(path) => match tail::load_attachment(&path) {
                        Ok(attachment) => {
                            let len = attachment.len();
                            match handle.stage_attachment(attachment).await {
                                Ok(()) => println!("-- attached {} ({len} bytes) --", path.display()),
                                Err(SyncError::Validation(e)) => eprintln!("-- {e} --"),
                                Err(e) => return Err(e.into()),
                            }
                        }
                        Err(e) => eprintln!("-- {e:#} --"),
                    },
                    InputLine::Detach => handle.clear_attachment().await?,
                    InputLine::Send(text) => {
                        handle.start_input().await?;
                        match handle.send(text, None).await {
                            Ok(receipt) if !receipt.emitted => {
                                eprintln!("-- not connected, message dropped --");
                            }
                            Ok(_) => {}
                            Err(SyncError::Validation(e)) => eprintln!("-- {e} --"),
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Sync client already stopped");
    }
    drop(session_tx);
    task.await.context("Sync task panicked")?;
    Ok(())
}

/// Print the user's conversations as a table, or as JSON.
pub async fn conversations_command(config: &ClientConfig, session: Session, json: bool) -> Result<()> {
    let (_session_tx, session_rx) = watch::channel(Some(session));
    let client = RestHistoryClient::new(&config.transport)?.with_sessions(session_rx);
    let conversations = client
        .conversations()
        .await
        .context("Failed to fetch conversations")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
    } else if conversations.is_empty() {
        println!("No conversations.");
    } else {
        println!("{:<38} {:<7} {:<24} {:>6}", "ID", "TYPE", "TITLE", "UNREAD");
        println!("{}", "-".repeat(78));
        for conv in conversations.iter() {
            let kind = match conv.kind {
                ConversationKind::Direct => "direct",
                ConversationKind::Group => "group",
            };
            println!(
                "{:<38} {:<7} {:<24} {:>6}",
                conv.id.as_str(),
                kind,
                tail::truncate(conv.title(), 24),
                conv.unread_count
            );
        }
        println!("\n{} conversation(s)", conversations.len());
    }

    Ok(())
}
