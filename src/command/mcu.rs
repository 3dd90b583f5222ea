//! Hardware commands: macros that run inside the controller firmware.
//!
//! The host only sends the macro's sync name to start it and the `end` line
//! to stop it. The run never completes on its own.

use super::{Command, CommandEnv, CommandError, CommandFactory, CommandIo, CommandKind};
use crate::registry::{CommandBuilder, CommandManifest};
use crate::transport::Frame;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Line that makes the firmware abort the running macro.
pub const END_LINE: &str = "end";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct McuParams {
    sync_name: String,
}

#[derive(Debug, Default)]
pub struct McuSyncBuilder;

impl CommandBuilder for McuSyncBuilder {
    fn kinds(&self) -> &'static [CommandKind] {
        &[CommandKind::Hardware]
    }

    fn build(&self, manifest: &CommandManifest) -> Result<Arc<dyn CommandFactory>, CommandError> {
        let params: McuParams = toml::Value::Table(manifest.params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| CommandError::InvalidParams(e.to_string()))?;

        let sync_name = params.sync_name.trim().to_string();
        if sync_name.is_empty() || sync_name == END_LINE || sync_name.contains(|c| c == '\r' || c == '\n') {
            return Err(CommandError::InvalidParams(format!(
                "unusable sync name {:?}",
                params.sync_name
            )));
        }

        let name = manifest.name.clone();
        Ok(Arc::new(
            move |_env: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
                Ok(Box::new(McuSyncCommand {
                    name: name.clone(),
                    sync_name: sync_name.clone(),
                }))
            },
        ))
    }
}

pub struct McuSyncCommand {
    name: String,
    sync_name: String,
}

#[async_trait]
impl Command for McuSyncCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, io: &CommandIo) -> Result<(), CommandError> {
        io.send(Frame::line(&self.sync_name)).await?;
        info!("Firmware macro {} started", self.sync_name);
        io.cancelled().await;
        Ok(())
    }

    async fn end(&self, io: &CommandIo) -> Result<(), CommandError> {
        io.send(Frame::line(END_LINE)).await?;
        info!("Firmware macro {} ended", self.sync_name);
        Ok(())
    }
}
