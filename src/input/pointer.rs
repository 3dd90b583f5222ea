//! Pointer-to-analog-stick bridge.
//!
//! The pointer position inside the preview area is mapped linearly onto the
//! stick: the area's center is the rest position, its edges are full tilt.

use super::SourceError;
use crate::arbiter::Submitter;
use crate::transport::{ControllerState, Stick, StickSide};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PointerSettings {
    pub side: StickSide,
}

pub struct PointerSource {
    submitter: Submitter,
    side: StickSide,
    listening: bool,
    state: ControllerState,
}

impl PointerSource {
    pub fn new(submitter: Submitter, settings: PointerSettings) -> Self {
        Self {
            submitter,
            side: settings.side,
            listening: false,
            state: ControllerState::neutral(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn side(&self) -> StickSide {
        self.side
    }

    /// Starts forwarding pointer events. No-op while listening.
    pub fn listen(&mut self) {
        if !self.listening {
            self.listening = true;
            info!("Pointer listening on the {:?} stick", self.side);
        }
    }

    /// Stops forwarding and recenters the stick if it was moved.
    pub async fn stop(&mut self) {
        if !self.listening {
            return;
        }
        if self.state.stick(self.side) != Stick::CENTER {
            if let Err(e) = self.recenter().await {
                debug!("Could not recenter stick on stop: {}", e);
            }
        }
        self.listening = false;
        info!("Pointer stopped");
    }

    /// Maps a pointer position inside a `width` x `height` area onto the
    /// stick. Returns whether a frame was written.
    pub async fn on_motion(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    ) -> Result<bool, SourceError> {
        if !self.listening {
            return Ok(false);
        }
        if !(width > 0.0 && height > 0.0) {
            return Err(SourceError::EmptyArea { width, height });
        }

        let stick = Stick::from_normalized(x / width * 2.0 - 1.0, y / height * 2.0 - 1.0);
        if stick == self.state.stick(self.side) {
            return Ok(false);
        }

        self.state.set_stick(self.side, stick);
        self.submitter.submit(self.state.to_frame()).await?;
        Ok(true)
    }

    /// Pointer button released: the stick returns to rest.
    pub async fn on_release(&mut self) -> Result<bool, SourceError> {
        if !self.listening {
            return Ok(false);
        }
        self.recenter().await?;
        Ok(true)
    }

    async fn recenter(&mut self) -> Result<(), SourceError> {
        self.state.set_stick(self.side, Stick::CENTER);
        self.submitter.submit(self.state.to_frame()).await?;
        Ok(())
    }
}
