//! Single-owner service loop around [`Timeline`].
//!
//! The timeline state machine runs inside one task; requests arrive over a
//! channel and are processed one at a time, so the core needs no locks.
//! Readers observe complete snapshots over a watch channel, never a
//! partially merged list. The loop also owns the two timers: the debounced
//! reaction reload (last-scheduler-wins) and the optional periodic refresh.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::configuration::REACTION_RELOAD_DELAY;
use crate::identity::IdentityApi;
use crate::storage::TimelineStore;
use crate::timeline::Timeline;
use crate::types::Message;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug)]
pub enum TimelineCommand {
    LoadInitial,
    LoadOlder,
    RefreshAfterDecrypt,
    ApplyReactionEvent {
        message_id: String,
        emoji: String,
        sender_id: String,
        action: String,
    },
    AddReaction {
        message_id: String,
        emoji: String,
    },
    ToggleReaction {
        message_id: String,
        emoji: String,
    },
}

/// Read-only view published after every mutation.
#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    pub messages: Arc<Vec<Message>>,
    pub has_more_messages: bool,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl Default for TimelineSnapshot {
    fn default() -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            has_more_messages: true,
            is_loading: false,
            last_error: None,
        }
    }
}

/// Cheaply cloneable handle to the service task.
#[derive(Clone)]
pub struct TimelineHandle {
    commands: mpsc::Sender<TimelineCommand>,
    snapshots: watch::Receiver<TimelineSnapshot>,
    cancel: CancellationToken,
}

impl TimelineHandle {
    pub async fn load_initial(&self) {
        self.send(TimelineCommand::LoadInitial).await;
    }

    pub async fn load_older(&self) {
        self.send(TimelineCommand::LoadOlder).await;
    }

    pub async fn refresh_after_decrypt(&self) {
        self.send(TimelineCommand::RefreshAfterDecrypt).await;
    }

    pub async fn apply_reaction_event(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
        sender_id: impl Into<String>,
        action: impl Into<String>,
    ) {
        self.send(TimelineCommand::ApplyReactionEvent {
            message_id: message_id.into(),
            emoji: emoji.into(),
            sender_id: sender_id.into(),
            action: action.into(),
        })
        .await;
    }

    pub async fn add_reaction(&self, message_id: impl Into<String>, emoji: impl Into<String>) {
        self.send(TimelineCommand::AddReaction {
            message_id: message_id.into(),
            emoji: emoji.into(),
        })
        .await;
    }

    pub async fn toggle_reaction(&self, message_id: impl Into<String>, emoji: impl Into<String>) {
        self.send(TimelineCommand::ToggleReaction {
            message_id: message_id.into(),
            emoji: emoji.into(),
        })
        .await;
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> TimelineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot_stream(&self) -> impl futures::Stream<Item = TimelineSnapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Conversation teardown: stops the service loop and its timers.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: TimelineCommand) {
        if self.commands.send(command).await.is_err() {
            tracing::warn!("timeline service is gone, command dropped");
        }
    }
}

/// Spawn the service loop owning `timeline`. `periodic_refresh` arms the
/// background tick that re-runs the post-decrypt refresh.
pub fn spawn<S, A>(
    mut timeline: Timeline<S, A>,
    periodic_refresh: Option<Duration>,
) -> TimelineHandle
where
    S: TimelineStore + 'static,
    A: IdentityApi + 'static,
{
    let (commands, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let (snap_tx, snapshots) = watch::channel(TimelineSnapshot::default());
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut reload_deadline: Option<Instant> = None;
        let mut refresh_deadline = periodic_refresh.map(|period| Instant::now() + period);

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    tracing::debug!("timeline service received cancellation signal");
                    break;
                }
                maybe = rx.recv() => {
                    let Some(command) = maybe else { break };
                    let fresh = matches!(command, TimelineCommand::LoadInitial);
                    handle_command(&mut timeline, command).await;
                    if fresh {
                        // Last scheduler wins: overwrite any pending reload.
                        reload_deadline = Some(Instant::now() + REACTION_RELOAD_DELAY);
                    }
                    publish(&snap_tx, &timeline);
                }
                _ = wait_until(reload_deadline) => {
                    reload_deadline = None;
                    timeline.reload_reactions().await;
                    publish(&snap_tx, &timeline);
                }
                _ = wait_until(refresh_deadline) => {
                    refresh_deadline = periodic_refresh.map(|period| Instant::now() + period);
                    let _ = timeline.refresh_after_decrypt().await;
                    publish(&snap_tx, &timeline);
                }
            }
        }
    });

    TimelineHandle {
        commands,
        snapshots,
        cancel,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn handle_command<S, A>(timeline: &mut Timeline<S, A>, command: TimelineCommand)
where
    S: TimelineStore + 'static,
    A: IdentityApi,
{
    use TimelineCommand::*;
    // Load failures are already recorded on the timeline's `last_error`.
    match command {
        LoadInitial => {
            let _ = timeline.load_initial().await;
        }
        LoadOlder => {
            let _ = timeline.load_older().await;
        }
        RefreshAfterDecrypt => {
            let _ = timeline.refresh_after_decrypt().await;
        }
        ApplyReactionEvent {
            message_id,
            emoji,
            sender_id,
            action,
        } => timeline.apply_reaction_event(&message_id, &emoji, &sender_id, &action),
        AddReaction { message_id, emoji } => timeline.add_reaction(&message_id, &emoji),
        ToggleReaction { message_id, emoji } => timeline.toggle_reaction(&message_id, &emoji),
    }
}

fn publish<S, A>(tx: &watch::Sender<TimelineSnapshot>, timeline: &Timeline<S, A>)
where
    S: TimelineStore + 'static,
    A: IdentityApi,
{
    tx.send_replace(TimelineSnapshot {
        messages: Arc::new(timeline.messages().to_vec()),
        has_more_messages: timeline.has_more_messages(),
        is_loading: timeline.is_loading(),
        last_error: timeline.last_error().map(|e| e.to_string()),
    });
}
