//! Sync actor and its handle.
//!
//! One task owns the [`SyncCore`] and feeds it every input in turn: handle
//! commands, session changes, channel events, fetch results and typing
//! timers. Fetches run as separate tasks and report back through a queue, so
//! the actor never waits on the network.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::ChannelFactory;
use crate::clock::{Clock, RuntimeClock};
use crate::composer::SendReceipt;
use crate::config::SyncConfig;
use crate::engine::{Effect, FetchOutcome, SyncCore};
use crate::error::{SyncError, ValidationError};
use crate::history::HistoryFetcher;
use crate::model::{Attachment, ConversationId, Session};
use crate::view::ConversationView;

#[derive(Debug)]
enum SyncCommand {
    Activate {
        conversation: Option<ConversationId>,
    },
    StartInput,
    StopInput,
    Send {
        text: Option<String>,
        attachment: Option<Attachment>,
        respond_to: oneshot::Sender<Result<SendReceipt, ValidationError>>,
    },
    StageAttachment {
        attachment: Attachment,
        respond_to: oneshot::Sender<Result<(), ValidationError>>,
    },
    ClearAttachment,
    RefreshConversations,
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the sync actor. Cheap to clone; the actor stops once every
/// handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<SyncCommand>,
    view: watch::Receiver<ConversationView>,
}

impl SyncHandle {
    /// Switch the active conversation (`None` leaves the current one).
    pub async fn activate(&self, conversation: Option<ConversationId>) -> Result<(), SyncError> {
        self.command(SyncCommand::Activate { conversation }).await
    }

    /// Report a keystroke in the message input.
    pub async fn start_input(&self) -> Result<(), SyncError> {
        self.command(SyncCommand::StartInput).await
    }

    pub async fn stop_input(&self) -> Result<(), SyncError> {
        self.command(SyncCommand::StopInput).await
    }

    /// Send to the active conversation. Falls back to the staged attachment
    /// when `attachment` is `None`.
    pub async fn send(
        &self,
        text: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<SendReceipt, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(SyncCommand::Send {
            text,
            attachment,
            respond_to: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SyncError::ClientClosed)??)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendReceipt, SyncError> {
        self.send(Some(text.into()), None).await
    }

    pub async fn stage_attachment(&self, attachment: Attachment) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(SyncCommand::StageAttachment {
            attachment,
            respond_to: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SyncError::ClientClosed)??)
    }

    pub async fn clear_attachment(&self) -> Result<(), SyncError> {
        self.command(SyncCommand::ClearAttachment).await
    }

    pub async fn refresh_conversations(&self) -> Result<(), SyncError> {
        self.command(SyncCommand::RefreshConversations).await
    }

    /// Latest published view.
    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// A receiver that is notified whenever the view changes.
    pub fn subscribe_view(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    /// Stop typing, close the connection and end the actor.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(SyncCommand::Shutdown { respond_to: tx }).await?;
        rx.await.map_err(|_| SyncError::ClientClosed)
    }

    async fn command(&self, command: SyncCommand) -> Result<(), SyncError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SyncError::ClientClosed)
    }
}

pub struct SyncClient;

impl SyncClient {
    /// Spawn the sync actor on the current runtime.
    pub fn spawn<H: HistoryFetcher>(
        config: SyncConfig,
        factory: Arc<dyn ChannelFactory>,
        history: Arc<H>,
        sessions: watch::Receiver<Option<Session>>,
    ) -> (SyncHandle, JoinHandle<()>) {
        Self::spawn_with_clock(config, factory, history, sessions, Arc::new(RuntimeClock))
    }

    pub fn spawn_with_clock<H: HistoryFetcher>(
        config: SyncConfig,
        factory: Arc<dyn ChannelFactory>,
        history: Arc<H>,
        sessions: watch::Receiver<Option<Session>>,
        clock: Arc<dyn Clock>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.command_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(ConversationView::default());
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let actor = SyncActor {
            core: SyncCore::new(&config, factory, clock),
            history,
            receiver,
            sessions,
            sessions_open: true,
            fetch_tx,
            fetch_rx,
            fetch_cancel: CancellationToken::new(),
            view_tx,
        };
        let task = tokio::spawn(actor.run());

        (
            SyncHandle {
                sender,
                view: view_rx,
            },
            task,
        )
    }
}

struct SyncActor<H> {
    core: SyncCore,
    history: Arc<H>,
    receiver: mpsc::Receiver<SyncCommand>,
    sessions: watch::Receiver<Option<Session>>,
    sessions_open: bool,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    /// Cancelled whenever the session changes
    fetch_cancel: CancellationToken,
    view_tx: watch::Sender<ConversationView>,
}

impl<H: HistoryFetcher> SyncActor<H> {
    async fn run(mut self) {
        let initial = self.sessions.borrow_and_update().clone();
        self.apply_session(initial.as_ref());
        self.publish();

        let mut reply = None;
        loop {
            let wait = self
                .core
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(self.core.now()));
            let timer = async move {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else {
                        debug!("All sync handles dropped");
                        break;
                    };
                    if let ControlFlow::Break(respond_to) = self.handle_command(command) {
                        reply = Some(respond_to);
                        break;
                    }
                }
                changed = self.sessions.changed(), if self.sessions_open => {
                    if changed.is_ok() {
                        let session = self.sessions.borrow_and_update().clone();
                        self.apply_session(session.as_ref());
                    } else {
                        debug!("Session provider went away, keeping current session");
                        self.sessions_open = false;
                    }
                }
                inbound = self.core.recv() => {
                    let effects = self.core.handle_inbound(inbound);
                    self.run_effects(effects);
                }
                Some(outcome) = self.fetch_rx.recv() => {
                    self.core.apply_fetch(outcome);
                }
                () = timer => {
                    self.core.tick();
                }
            }
            self.publish();
        }

        self.fetch_cancel.cancel();
        self.core.shutdown();
        self.publish();
        info!("Sync actor stopped");
        if let Some(respond_to) = reply {
            let _ = respond_to.send(());
        }
    }

    fn handle_command(&mut self, command: SyncCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            SyncCommand::Activate { conversation } => {
                let effects = self.core.activate(conversation);
                self.run_effects(effects);
            }
            SyncCommand::StartInput => self.core.start_input(),
            SyncCommand::StopInput => self.core.stop_input(),
            SyncCommand::Send {
                text,
                attachment,
                respond_to,
            } => {
                let _ = respond_to.send(self.core.send(text.as_deref(), attachment));
            }
            SyncCommand::StageAttachment {
                attachment,
                respond_to,
            } => {
                let _ = respond_to.send(self.core.stage_attachment(attachment));
            }
            SyncCommand::ClearAttachment => self.core.clear_attachment(),
            SyncCommand::RefreshConversations => {
                let effects = self.core.refresh_conversations();
                self.run_effects(effects);
            }
            SyncCommand::Shutdown { respond_to } => return ControlFlow::Break(respond_to),
        }
        ControlFlow::Continue(())
    }

    fn apply_session(&mut self, session: Option<&Session>) {
        let epoch = self.core.epoch();
        let effects = self.core.set_session(session);
        if self.core.epoch() != epoch {
            // Nothing fetched for the previous identity is wanted any more.
            self.fetch_cancel.cancel();
            self.fetch_cancel = CancellationToken::new();
        }
        self.run_effects(effects);
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            let history = Arc::clone(&self.history);
            let tx = self.fetch_tx.clone();
            let cancel = self.fetch_cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return,
                    outcome = perform(history, effect) => outcome,
                };
                let _ = tx.send(outcome);
            });
        }
    }

    fn publish(&self) {
        let next = self.core.view();
        self.view_tx.send_if_modified(|view| {
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }
}

async fn perform<H: HistoryFetcher>(history: Arc<H>, effect: Effect) -> FetchOutcome {
    match effect {
        Effect::FetchBacklog(ticket) => {
            let result = history.fetch_backlog(&ticket.conversation).await;
            FetchOutcome::Backlog { ticket, result }
        }
        Effect::FetchRoster {
            conversation,
            epoch,
        } => {
            let result = history.fetch_roster(&conversation).await;
            FetchOutcome::Roster {
                conversation,
                epoch,
                result,
            }
        }
        Effect::FetchConversations { epoch } => {
            let result = history.fetch_conversations().await;
            FetchOutcome::Conversations { epoch, result }
        }
    }
}
