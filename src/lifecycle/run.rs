//! One run of one command, from launch to teardown.

use super::{LifecycleError, RunOutcome, RunReport};
use crate::command::{Command, CommandEnv, CommandError, CommandIo};
use statum::{machine, state};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum RunState {
    Running,     // body executing
    TearingDown, // body finished or dropped, `end` pending
}

#[machine]
pub struct CommandRun<S: RunState> {
    name: String,
    command: Box<dyn Command>,
    io: CommandIo,
    teardown_io: CommandIo,
    cancel: CancellationToken,
    grace: Duration,
}

enum Ending {
    Returned(Result<(), CommandError>),
    Stopped,
    TransportLost,
}

impl CommandRun<Running> {
    pub fn launch(
        name: String,
        command: Box<dyn Command>,
        env: &CommandEnv,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        let io = CommandIo::new(env, cancel.clone());
        // `end` must still be able to write after the stop cancelled `io`.
        let teardown_io = CommandIo::new(env, CancellationToken::new());
        Self::new(name, command, io, teardown_io, cancel, grace)
    }

    /// Drives the body until it returns, is stopped, or the transport goes away.
    pub async fn run_to_end(self) -> (CommandRun<TearingDown>, RunOutcome) {
        info!("Running command {}", self.name);

        let outcome = {
            let body = self.command.start(&self.io);
            tokio::pin!(body);

            let ending = tokio::select! {
                biased;
                result = &mut body => Ending::Returned(result),
                _ = self.cancel.cancelled() => Ending::Stopped,
                _ = self.io.submitter().closed() => Ending::TransportLost,
            };

            match ending {
                Ending::Returned(Ok(())) if self.cancel.is_cancelled() => RunOutcome::Stopped,
                Ending::Returned(Ok(())) => RunOutcome::Completed,
                Ending::Returned(Err(CommandError::Cancelled)) => RunOutcome::Stopped,
                Ending::Returned(Err(e)) if self.io.submitter().is_closed() => {
                    warn!("{} lost the transport: {}", self.name, e);
                    RunOutcome::TransportLost
                }
                Ending::Returned(Err(e)) => {
                    error!("{} failed: {}", self.name, e);
                    RunOutcome::Failed(e)
                }
                Ending::Stopped => {
                    self.settle(body.as_mut()).await;
                    RunOutcome::Stopped
                }
                Ending::TransportLost => {
                    warn!("Transport closed under {}, forcing stop", self.name);
                    self.settle(body.as_mut()).await;
                    RunOutcome::TransportLost
                }
            }
        };

        (self.transition(), outcome)
    }

    /// Gives a stopped body the grace period to notice, then lets it go.
    async fn settle<F>(&self, body: Pin<&mut F>)
    where
        F: Future<Output = Result<(), CommandError>>,
    {
        self.cancel.cancel();
        match tokio::time::timeout(self.grace, body).await {
            Ok(result) => debug!("{} body exited after stop: {:?}", self.name, result),
            Err(_) => warn!(
                "{} did not exit within {:?}, dropping its body",
                self.name, self.grace
            ),
        }
    }
}

impl CommandRun<TearingDown> {
    /// Calls `end` exactly once and produces the run's report.
    pub async fn teardown(self, outcome: RunOutcome) -> RunReport {
        debug!("Tearing down {}", self.name);

        let result = match tokio::time::timeout(self.grace, self.command.end(&self.teardown_io)).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Failed(format!(
                "end did not return within {:?}",
                self.grace
            ))),
        };

        let teardown_error = match result {
            Ok(()) => None,
            Err(e) => {
                let failure = LifecycleError::TeardownFailure {
                    name: self.name.clone(),
                    source: e,
                };
                error!("{}", failure);
                Some(failure)
            }
        };

        info!("Command {} ended: {}", self.name, outcome);
        RunReport {
            name: self.name,
            outcome,
            teardown_error,
        }
    }
}
