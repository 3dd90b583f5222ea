//! Command lifecycle - one active command per slot
//!
//! ```text
//!        start()                 stop()
//! Idle ──────────► Running ──────────────► Stopping
//!  ▲                  │ body returns           │ body exits or grace expires
//!  │                  ▼                        ▼
//!  └──────────── end() once, then on_complete once
//! ```
//!
//! Every run is owned by a single supervisor task. The supervisor is the only
//! place that calls `end`, resets the slot to Idle and fires the completion
//! callback, so a stop racing with self-completion cannot double-release the
//! command or double-fire the callback. `stop()` only cancels the run's token
//! and waits for the supervisor to report back.
//!
//! The slot lock is never held across an `.await`, while the command is being
//! constructed or while the callback runs. Construction happens against a
//! reservation, so a second `start` is refused as Busy but `active_name()` and
//! `stop()` stay responsive.
//!
//! Runs are spawned on the runtime that created the lifecycle, so `start` may
//! be called from any thread.

mod run;

pub use run::{CommandRun, RunState};

use crate::command::{CommandEnv, CommandError};
use crate::registry::CommandDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopping,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "Idle"),
            LifecycleState::Running => write!(f, "Running"),
            LifecycleState::Stopping => write!(f, "Stopping"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{active} is still active, stop it first")]
    Busy { active: String },

    #[error("Failed to construct {name}: {source}")]
    Construction { name: String, source: CommandError },

    #[error("Teardown of {name} failed: {source}")]
    TeardownFailure { name: String, source: CommandError },
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The body returned on its own
    Completed,
    /// The body returned an error on its own
    Failed(CommandError),
    /// `stop()` was called
    Stopped,
    /// The arbiter closed under the run
    TransportLost,
    /// The run task panicked; `end` could not be called
    Panicked,
}

impl Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed(e) => write!(f, "failed ({})", e),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::TransportLost => write!(f, "transport lost"),
            RunOutcome::Panicked => write!(f, "panicked"),
        }
    }
}

/// Handed to the completion callback, exactly once per run.
#[derive(Debug)]
pub struct RunReport {
    pub name: String,
    pub outcome: RunOutcome,
    pub teardown_error: Option<LifecycleError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// How long a stopped body (and `end`) may take before it is abandoned.
    #[serde(with = "millis", rename = "stop_grace_ms")]
    pub stop_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

struct ActiveRun {
    id: u64,
    name: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveRun>,
    // command being constructed outside the lock
    reserved: Option<String>,
    next_run: u64,
}

impl Slot {
    fn occupant(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|active| active.name.as_str())
            .or(self.reserved.as_deref())
    }
}

struct Shared {
    slot: Mutex<Slot>,
    state: watch::Sender<LifecycleState>,
    env: CommandEnv,
    settings: LifecycleSettings,
    runtime: Handle,
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: u64) {
        let mut slot = self.lock_slot();
        if slot.active.as_ref().is_some_and(|active| active.id == id) {
            slot.active = None;
            self.state.send_replace(LifecycleState::Idle);
        }
    }
}

/// Holds the slot while a command is constructed. Dropping it uncommitted
/// frees the slot again, including when the factory panics.
struct Reservation<'a> {
    shared: &'a Shared,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.lock_slot().reserved = None;
        }
    }
}

/// The single command slot. Cheap to clone; clones share the slot.
#[derive(Clone)]
pub struct CommandLifecycle {
    shared: Arc<Shared>,
}

impl CommandLifecycle {
    /// Creates an idle lifecycle whose runs execute on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(env: CommandEnv, settings: LifecycleSettings) -> Self {
        Self::with_runtime(env, settings, Handle::current())
    }

    pub fn with_runtime(env: CommandEnv, settings: LifecycleSettings, runtime: Handle) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                state,
                env,
                settings,
                runtime,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    pub fn active_name(&self) -> Option<String> {
        self.shared
            .lock_slot()
            .active
            .as_ref()
            .map(|active| active.name.clone())
    }

    /// Instantiates `descriptor` and runs it in the background.
    ///
    /// `on_complete` fires exactly once when the run has ended and the slot
    /// is Idle again. It is not called if this returns an error.
    pub fn start<F>(&self, descriptor: &CommandDescriptor, on_complete: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(RunReport) + Send + 'static,
    {
        let name = descriptor.name().to_string();
        let mut reservation = {
            let mut slot = self.shared.lock_slot();
            if let Some(occupant) = slot.occupant() {
                warn!("Refusing to start {} while {} is active", name, occupant);
                return Err(LifecycleError::Busy {
                    active: occupant.to_string(),
                });
            }
            slot.reserved = Some(name.clone());
            Reservation {
                shared: &self.shared,
                committed: false,
            }
        };

        let command = descriptor.instantiate(&self.shared.env).map_err(|e| {
            warn!("Could not construct {}: {}", name, e);
            LifecycleError::Construction {
                name: name.clone(),
                source: e,
            }
        })?;

        let cancel = CancellationToken::new();
        let run = CommandRun::launch(
            name.clone(),
            command,
            &self.shared.env,
            cancel.clone(),
            self.shared.settings.stop_grace,
        );
        let (done_tx, done_rx) = watch::channel(false);

        // The supervisor is spawned under the lock, so its `finish` always
        // sees the committed run.
        let mut slot = self.shared.lock_slot();
        let id = slot.next_run;
        slot.next_run += 1;
        slot.reserved = None;
        slot.active = Some(ActiveRun {
            id,
            name: name.clone(),
            cancel,
            done: done_rx,
        });
        reservation.committed = true;
        self.shared.state.send_replace(LifecycleState::Running);
        self.shared.runtime.spawn(supervise(
            self.shared.clone(),
            id,
            name,
            run,
            on_complete,
            done_tx,
        ));
        drop(slot);

        Ok(())
    }

    /// Starts the selected command, if any. Returns whether a run started.
    pub fn start_selected<F>(
        &self,
        selected: Option<&CommandDescriptor>,
        on_complete: F,
    ) -> Result<bool, LifecycleError>
    where
        F: FnOnce(RunReport) + Send + 'static,
    {
        match selected {
            Some(descriptor) => self.start(descriptor, on_complete).map(|_| true),
            None => {
                info!("No commands have been assigned yet.");
                Ok(false)
            }
        }
    }

    /// Stops the active run and waits until its completion callback has run.
    /// No-op when idle or while the command is still being constructed.
    pub async fn stop(&self) {
        let mut done = {
            let slot = self.shared.lock_slot();
            let Some(active) = &slot.active else {
                debug!("Stop requested while idle");
                return;
            };

            if !active.cancel.is_cancelled() {
                info!("Stopping {}", active.name);
                self.shared.state.send_replace(LifecycleState::Stopping);
                active.cancel.cancel();
            }
            active.done.clone()
        };

        // Err means the supervisor is gone, which also ends the run.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn supervise<F>(
    shared: Arc<Shared>,
    id: u64,
    name: String,
    run: CommandRun<run::Running>,
    on_complete: F,
    done: watch::Sender<bool>,
) where
    F: FnOnce(RunReport) + Send + 'static,
{
    let task = tokio::spawn(async move {
        let (run, outcome) = run.run_to_end().await;
        run.teardown(outcome).await
    });

    let report = match task.await {
        Ok(report) => report,
        Err(e) => {
            error!("Run of {} aborted: {}", name, e);
            RunReport {
                name,
                outcome: RunOutcome::Panicked,
                teardown_error: None,
            }
        }
    };

    shared.finish(id);
    on_complete(report);
    let _ = done.send(true);
}

impl fmt::Debug for CommandLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLifecycle")
            .field("state", &self.state())
            .field("active", &self.active_name())
            .finish()
    }
}
