mod cli;

use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use color_eyre::{eyre::eyre, Result};
use padpilot::arbiter::{InputArbiter, SourceKind};
use padpilot::command::{CommandEnv, CommandKind};
use padpilot::config::AppConfig;
use padpilot::input::{ChannelHook, KeyInjector, KeyboardSource};
use padpilot::lifecycle::{CommandLifecycle, RunOutcome};
use padpilot::registry::{CommandRegistries, PluginLibrary};
use padpilot::transport::{available_ports, SerialTransport};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// How long a key typed on stdin is held.
const KEY_TAP: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    AppConfig::ensure_default(&config_path).await?;
    let mut config = AppConfig::load(&config_path).await?;
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud = baud;
    }

    match cli.command {
        Commands::Ports => cmd_ports(),
        Commands::List => cmd_list(&config).await,
        Commands::Run(args) => cmd_run(&mut config, &config_path, args).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = match std::env::var("RUST_LOG").as_deref() {
        Ok("trace") => Level::TRACE,
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn cmd_ports() -> Result<()> {
    let ports = available_ports().map_err(|e| eyre!("Failed to list serial ports: {}", e))?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn registries(config: &AppConfig) -> CommandRegistries {
    CommandRegistries::new(
        &config.commands.scripted_dir,
        &config.commands.hardware_dir,
        PluginLibrary::with_builtins(),
    )
}

async fn cmd_list(config: &AppConfig) -> Result<()> {
    let (scripted, hardware) = registries(config).load_all().await;

    for catalog in [scripted, hardware] {
        println!(
            "{} commands (generation {}, loaded {}):",
            catalog.kind(),
            catalog.generation(),
            catalog.loaded_at().format("%H:%M:%S")
        );
        if catalog.is_empty() {
            println!("  (none)");
        }
        for descriptor in catalog.iter() {
            match descriptor.source() {
                Some(source) => println!("  {} ({})", descriptor.name(), source.display()),
                None => println!("  {}", descriptor.name()),
            }
        }
    }
    Ok(())
}

async fn cmd_run(config: &mut AppConfig, config_path: &Path, args: RunArgs) -> Result<()> {
    let kind = if args.hardware {
        CommandKind::Hardware
    } else {
        CommandKind::Scripted
    };

    let registries = registries(config);
    let catalog = registries.get(kind).load().await;
    let descriptor = catalog
        .find(&args.name)
        .cloned()
        .ok_or_else(|| eyre!("No {} command named {:?}", kind, args.name))?;

    let mut transport = SerialTransport::system();
    transport
        .open(&config.serial.port, config.serial.baud)
        .map_err(|e| eyre!("Failed to open {}: {}", config.serial.port, e))?;
    if let Some(params) = transport.params().cloned() {
        if let Err(e) = config.remember_serial(&params, config_path).await {
            warn!("Could not save serial settings: {}", e);
        }
    }

    let arbiter =
        InputArbiter::spawn(transport).map_err(|e| eyre!("Failed to start arbiter: {}", e))?;
    let lifecycle = CommandLifecycle::new(
        CommandEnv::new(arbiter.submitter(SourceKind::Command)),
        config.lifecycle,
    );

    let mut keyboard = None;
    let mut stdin_task = None;
    if args.keyboard {
        let (hook, injector) = ChannelHook::new();
        let mut source = KeyboardSource::new(
            arbiter.submitter(SourceKind::Keyboard),
            config.keyboard.clone(),
            Box::new(hook),
        );
        source
            .listen()
            .map_err(|e| eyre!("Failed to start keyboard: {}", e))?;
        stdin_task = Some(forward_stdin(injector));
        keyboard = Some(source);
        info!("Type key names (e.g. `a`, `up`) and press enter to tap them");
    }

    let (done_tx, done_rx) = oneshot::channel();
    lifecycle
        .start(&descriptor, move |report| {
            let _ = done_tx.send(report);
        })
        .map_err(|e| eyre!("Failed to start {}: {}", args.name, e))?;

    let stopper = lifecycle.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping command");
            stopper.stop().await;
        }
    });

    let report = done_rx
        .await
        .map_err(|_| eyre!("Run of {} ended without a report", args.name))?;
    interrupt.abort();

    if let Some(task) = stdin_task {
        task.abort();
    }
    if let Some(mut source) = keyboard {
        source.stop().await;
    }
    arbiter
        .close()
        .await
        .map_err(|e| eyre!("Failed to close arbiter: {}", e))?;

    if let Some(e) = &report.teardown_error {
        warn!("{}", e);
    }
    match &report.outcome {
        RunOutcome::Completed | RunOutcome::Stopped => {
            info!("{} {}", report.name, report.outcome);
            Ok(())
        }
        outcome => Err(eyre!("{} {}", report.name, outcome)),
    }
}

fn forward_stdin(injector: KeyInjector) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            };

            for name in line.split_whitespace() {
                if !injector.press(name) {
                    debug!("Keyboard hook released, dropping {}", name);
                    return;
                }
                tokio::time::sleep(KEY_TAP).await;
                injector.release(name);
            }
        }
    })
}
