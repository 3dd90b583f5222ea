//! Scripted button sequences.
//!
//! Manifest example:
//!
//! ```toml
//! name = "Hatch Eggs"
//! entry = "sequence"
//!
//! [params]
//! repeat = 0            # 0 = until stopped
//!
//! [[params.steps]]
//! buttons = ["a"]
//! hold_ms = 100
//! wait_ms = 400
//!
//! [[params.steps]]
//! left = [0.0, -1.0]    # left stick up
//! hold_ms = 2000
//! ```

use super::{Command, CommandEnv, CommandError, CommandFactory, CommandIo, CommandKind};
use crate::registry::{CommandBuilder, CommandManifest};
use crate::transport::{Button, ControllerState, Hat, Stick};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

fn default_repeat() -> u32 {
    1
}

fn default_hold_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceParams {
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    pub steps: Vec<SequenceStep>,
}

/// One input pose held for `hold_ms`, followed by a release and `wait_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceStep {
    #[serde(default)]
    pub buttons: Vec<Button>,
    #[serde(default)]
    pub hat: Option<Hat>,
    #[serde(default)]
    pub left: Option<[f32; 2]>,
    #[serde(default)]
    pub right: Option<[f32; 2]>,
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    #[serde(default)]
    pub wait_ms: u64,
}

impl SequenceStep {
    fn state(&self) -> ControllerState {
        let mut state = ControllerState::neutral();
        for button in &self.buttons {
            state.press(*button);
        }
        if let Some(hat) = self.hat {
            state.hat = hat;
        }
        if let Some([x, y]) = self.left {
            state.left = Stick::from_normalized(x, y);
        }
        if let Some([x, y]) = self.right {
            state.right = Stick::from_normalized(x, y);
        }
        state
    }
}

impl SequenceParams {
    pub fn from_table(params: &toml::Table) -> Result<Self, CommandError> {
        let parsed: SequenceParams = toml::Value::Table(params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| CommandError::InvalidParams(e.to_string()))?;

        if parsed.steps.is_empty() {
            return Err(CommandError::InvalidParams(
                "sequence needs at least one step".to_string(),
            ));
        }
        Ok(parsed)
    }
}

/// Builder registered as the `sequence` plugin entry.
#[derive(Debug, Default)]
pub struct SequenceBuilder;

impl CommandBuilder for SequenceBuilder {
    fn kinds(&self) -> &'static [CommandKind] {
        &[CommandKind::Scripted]
    }

    fn build(&self, manifest: &CommandManifest) -> Result<Arc<dyn CommandFactory>, CommandError> {
        let params = Arc::new(SequenceParams::from_table(&manifest.params)?);
        let name = manifest.name.clone();
        debug!("Prepared sequence {} with {} steps", name, params.steps.len());

        Ok(Arc::new(
            move |_env: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
                Ok(Box::new(SequenceCommand {
                    name: name.clone(),
                    params: params.clone(),
                }))
            },
        ))
    }
}

pub struct SequenceCommand {
    name: String,
    params: Arc<SequenceParams>,
}

#[async_trait]
impl Command for SequenceCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, io: &CommandIo) -> Result<(), CommandError> {
        let neutral = ControllerState::neutral();
        let mut round = 0u32;

        loop {
            for step in &self.params.steps {
                io.send_state(&step.state()).await?;
                io.wait(Duration::from_millis(step.hold_ms)).await?;
                io.send_state(&neutral).await?;
                io.wait(Duration::from_millis(step.wait_ms)).await?;
            }

            round += 1;
            if self.params.repeat != 0 && round >= self.params.repeat {
                break;
            }
        }

        info!("{} finished after {} rounds", self.name, round);
        Ok(())
    }

    async fn end(&self, io: &CommandIo) -> Result<(), CommandError> {
        // Leave nothing pressed.
        io.send_state(&ControllerState::neutral()).await
    }
}
