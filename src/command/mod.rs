//! Command capability contract
//!
//! A command is an opaque automation unit. Whatever it does internally, the
//! lifecycle only relies on the [`Command`] trait:
//!
//! - [`Command::name`] - display name
//! - [`Command::start`] - the body of one run; returning ends the run
//! - [`Command::end`] - teardown, called exactly once per run
//!
//! Commands never touch the transport. Every frame goes through the
//! [`CommandIo`] they are handed, which routes it to the input arbiter and
//! refuses new writes once the run has been asked to stop.
//!
//! Builtin commands:
//!
//! 1. [`sequence`] - Scripted button/stick sequences
//! 2. [`mcu`] - Hardware commands that trigger firmware-resident macros

pub mod mcu;
pub mod sequence;

use crate::arbiter::{ArbiterError, Submitter};
use crate::transport::{ControllerState, Frame};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The two plugin families, each discovered from its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Runs on the host and drives the controller frame by frame
    Scripted,
    /// Triggers a macro that lives in the controller firmware
    Hardware,
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Scripted => write!(f, "Scripted"),
            CommandKind::Hardware => write!(f, "Hardware"),
        }
    }
}

/// Optional facilities a command may require from its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Access to the latest camera frame
    Camera,
}

impl Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Camera => write!(f, "camera"),
        }
    }
}

/// One captured camera image. The core passes it through uninterpreted.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// Camera collaborator handed to commands that require [`Capability::Camera`].
pub trait FrameSource: Send + Sync {
    fn latest(&self) -> Option<CameraFrame>;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command was stopped")]
    Cancelled,

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error("Required capability missing: {0}")]
    MissingCapability(Capability),

    #[error("Invalid command parameters: {0}")]
    InvalidParams(String),

    #[error("Command failed: {0}")]
    Failed(String),
}

/// What a command instance gets from the outside world at construction.
#[derive(Clone)]
pub struct CommandEnv {
    pub submitter: Submitter,
    pub camera: Option<Arc<dyn FrameSource>>,
}

impl CommandEnv {
    pub fn new(submitter: Submitter) -> Self {
        Self {
            submitter,
            camera: None,
        }
    }

    pub fn with_camera(mut self, camera: Arc<dyn FrameSource>) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn provides(&self, capability: Capability) -> bool {
        match capability {
            Capability::Camera => self.camera.is_some(),
        }
    }
}

/// Frame output and timing for one run of a command.
pub struct CommandIo {
    submitter: Submitter,
    cancel: CancellationToken,
    camera: Option<Arc<dyn FrameSource>>,
}

impl CommandIo {
    pub(crate) fn new(env: &CommandEnv, cancel: CancellationToken) -> Self {
        Self {
            submitter: env.submitter.clone(),
            cancel,
            camera: env.camera.clone(),
        }
    }

    /// Writes one frame. Fails with [`CommandError::Cancelled`] once the run
    /// has been asked to stop; a frame already handed over is still written.
    pub async fn send(&self, frame: Frame) -> Result<(), CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        self.submitter.submit(frame).await?;
        Ok(())
    }

    pub async fn send_state(&self, state: &ControllerState) -> Result<(), CommandError> {
        self.send(state.to_frame()).await
    }

    /// Sleeps, waking early with [`CommandError::Cancelled`] on stop.
    pub async fn wait(&self, duration: Duration) -> Result<(), CommandError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run has been asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn camera(&self) -> Option<&Arc<dyn FrameSource>> {
        self.camera.as_ref()
    }

    pub(crate) fn submitter(&self) -> &Submitter {
        &self.submitter
    }
}

/// Capability contract every command instance satisfies.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Body of one run. Returning (with any result) is self-completion.
    async fn start(&self, io: &CommandIo) -> Result<(), CommandError>;

    /// Teardown after the body has finished or was stopped.
    async fn end(&self, _io: &CommandIo) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Creates command instances; held by a descriptor for its whole generation.
pub trait CommandFactory: Send + Sync {
    fn create(&self, env: &CommandEnv) -> Result<Box<dyn Command>, CommandError>;
}

impl<F> CommandFactory for F
where
    F: Fn(&CommandEnv) -> Result<Box<dyn Command>, CommandError> + Send + Sync,
{
    fn create(&self, env: &CommandEnv) -> Result<Box<dyn Command>, CommandError> {
        self(env)
    }
}
