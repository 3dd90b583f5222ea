#![allow(dead_code)]

use async_trait::async_trait;
use padpilot::arbiter::InputArbiter;
use padpilot::command::{Command, CommandEnv, CommandError, CommandIo, CommandKind};
use padpilot::registry::CommandDescriptor;
use padpilot::transport::mock::MemoryPort;
use padpilot::transport::{Frame, SerialTransport};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn open_arbiter(port: &MemoryPort) -> InputArbiter {
    let mut transport = SerialTransport::new(port.opener());
    transport.open("mem", 9600).unwrap();
    InputArbiter::spawn(transport).unwrap()
}

pub fn write_manifest(dir: &Path, file: &str, content: &str) {
    std::fs::write(dir.join(file), content).unwrap();
}

pub fn sequence_manifest(name: &str) -> String {
    format!(
        "name = \"{}\"\nentry = \"sequence\"\n\n[[params.steps]]\nbuttons = [\"a\"]\nhold_ms = 1\n",
        name
    )
}

/// Counts what the lifecycle does with each instance.
#[derive(Debug, Default)]
pub struct Probe {
    pub constructed: AtomicUsize,
    pub ended: AtomicUsize,
    pub completed: AtomicUsize,
}

impl Probe {
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Sends `pulses` frames 1ms apart, then returns. `None` pulses until stopped.
pub struct Pulse {
    pub pulses: Option<usize>,
    pub end_delay: Duration,
    pub probe: Arc<Probe>,
}

#[async_trait]
impl Command for Pulse {
    fn name(&self) -> &str {
        "pulse"
    }

    async fn start(&self, io: &CommandIo) -> Result<(), CommandError> {
        let mut sent = 0;
        while self.pulses.map_or(true, |pulses| sent < pulses) {
            io.send(Frame::line("pulse")).await?;
            io.wait(Duration::from_millis(1)).await?;
            sent += 1;
        }
        Ok(())
    }

    async fn end(&self, _io: &CommandIo) -> Result<(), CommandError> {
        if !self.end_delay.is_zero() {
            tokio::time::sleep(self.end_delay).await;
        }
        self.probe.ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn pulse_descriptor(pulses: Option<usize>, end_delay: Duration, probe: Arc<Probe>) -> CommandDescriptor {
    CommandDescriptor::new(
        "pulse",
        CommandKind::Scripted,
        Arc::new(move |_: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
            probe.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Pulse {
                pulses,
                end_delay,
                probe: probe.clone(),
            }))
        }),
    )
}
