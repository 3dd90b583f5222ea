//! Keyboard-to-controller bridge.

use super::{KeyEvent, KeyMap, KeyState, KeyboardHook, SourceError};
use crate::arbiter::{ArbiterError, Submitter};
use crate::transport::ControllerState;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct KeyboardSource {
    submitter: Submitter,
    keymap: Arc<KeyMap>,
    hook: Box<dyn KeyboardHook>,
    listener: Option<Listener>,
    runtime: Handle,
}

impl KeyboardSource {
    /// The forwarding task runs on the current runtime, so `listen` also
    /// works from a thread outside it.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(submitter: Submitter, keymap: KeyMap, hook: Box<dyn KeyboardHook>) -> Self {
        Self {
            submitter,
            keymap: Arc::new(keymap),
            hook,
            listener: None,
            runtime: Handle::current(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Installs the hook and starts forwarding. No-op while listening.
    pub fn listen(&mut self) -> Result<(), SourceError> {
        if self.listener.is_some() {
            debug!("Keyboard already listening");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.hook.install(tx)?;

        let cancel = CancellationToken::new();
        let task = self.runtime.spawn(forward(
            rx,
            self.keymap.clone(),
            self.submitter.clone(),
            cancel.clone(),
        ));
        self.listener = Some(Listener { cancel, task });
        info!("Keyboard listening");
        Ok(())
    }

    /// Releases the hook, stops forwarding and releases all held inputs.
    /// No-op when not listening.
    pub async fn stop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        self.hook.release();
        listener.cancel.cancel();
        if let Err(e) = listener.task.await {
            warn!("Keyboard listener ended abnormally: {}", e);
        }

        match self
            .submitter
            .submit(ControllerState::neutral().to_frame())
            .await
        {
            Ok(()) => debug!("Released held keyboard inputs"),
            Err(ArbiterError::Closed) => debug!("Transport closed, nothing to release"),
            Err(e) => warn!("Failed to release keyboard inputs: {}", e),
        }
        info!("Keyboard stopped");
    }
}

impl Drop for KeyboardSource {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.hook.release();
            listener.cancel.cancel();
        }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<KeyEvent>,
    keymap: Arc<KeyMap>,
    submitter: Submitter,
    cancel: CancellationToken,
) {
    let mut keys = KeyState::default();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(state) = keys.apply(&keymap, &event) else {
            continue;
        };
        match submitter.submit(state.to_frame()).await {
            Ok(()) => {}
            Err(ArbiterError::Closed) => {
                warn!("Transport closed, keyboard forwarding ends");
                break;
            }
            Err(e) => warn!("Keyboard frame failed: {}", e),
        }
    }
    debug!("Keyboard listener finished");
}
