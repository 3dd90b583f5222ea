//! Live input bridges
//!
//! Two independently attachable frame sources next to the running command:
//!
//! - [`KeyboardSource`] - key events from a [`KeyboardHook`] mapped through a
//!   [`KeyMap`] onto buttons and the hat
//! - [`PointerSource`] - pointer positions inside the preview area mapped
//!   onto one analog stick
//!
//! Both write through their own arbiter [`Submitter`](crate::arbiter::Submitter).
//! `listen()` while listening and `stop()` while stopped are no-ops, so
//! focus-in/focus-out churn never leaks a second listener.

pub mod keyboard;
pub mod keymap;
pub mod pointer;

pub use keyboard::KeyboardSource;
pub use keymap::{HatDirection, KeyMap, KeyState};
pub use pointer::{PointerSettings, PointerSource};

use crate::arbiter::ArbiterError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Keyboard hook failed: {0}")]
    Hook(String),

    #[error("Pointer area {width}x{height} is empty")]
    EmptyArea { width: f32, height: f32 },

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
}

/// Lowercase key name such as `"a"`, `"up"` or `"enter"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    pub fn char(c: char) -> Self {
        Self(c.to_lowercase().collect())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn press(key: Key) -> Self {
        Self { key, pressed: true }
    }

    pub fn release(key: Key) -> Self {
        Self {
            key,
            pressed: false,
        }
    }
}

/// OS-level keyboard capture, provided by the platform layer.
pub trait KeyboardHook: Send {
    /// Starts delivering key events to `events`.
    fn install(&mut self, events: mpsc::UnboundedSender<KeyEvent>) -> Result<(), SourceError>;

    /// Stops delivering events. Must be safe to call when not installed.
    fn release(&mut self);
}

type HookTarget = Arc<Mutex<Option<mpsc::UnboundedSender<KeyEvent>>>>;

/// Hook fed from a [`KeyInjector`] instead of the OS.
#[derive(Debug, Default)]
pub struct ChannelHook {
    target: HookTarget,
}

impl ChannelHook {
    pub fn new() -> (Self, KeyInjector) {
        let hook = Self::default();
        let injector = KeyInjector {
            target: hook.target.clone(),
        };
        (hook, injector)
    }
}

impl KeyboardHook for ChannelHook {
    fn install(&mut self, events: mpsc::UnboundedSender<KeyEvent>) -> Result<(), SourceError> {
        if Arc::strong_count(&self.target) == 1 {
            return Err(SourceError::Hook("no injector left to deliver keys".to_string()));
        }
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
        debug!("Channel hook installed");
        Ok(())
    }

    fn release(&mut self) {
        if self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Channel hook released");
        }
    }
}

/// Sending half of a [`ChannelHook`].
#[derive(Debug, Clone)]
pub struct KeyInjector {
    target: HookTarget,
}

impl KeyInjector {
    /// Delivers `event` if the hook is installed. Returns whether it was.
    pub fn send(&self, event: KeyEvent) -> bool {
        match &*self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn press(&self, name: &str) -> bool {
        self.send(KeyEvent::press(Key::new(name)))
    }

    pub fn release(&self, name: &str) -> bool {
        self.send(KeyEvent::release(Key::new(name)))
    }

    pub fn is_installed(&self) -> bool {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
