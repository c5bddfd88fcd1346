//! Command-line front end.
//!
//! ```text
//! tachikoma agent      run one agent on the bus
//! tachikoma user       chat on the bus from the terminal
//! tachikoma archive    archive every message seen on the channel
//! tachikoma publish    publish one raw message
//! tachikoma subscribe  print raw messages matching a filter
//! ```

mod user;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{RunLoop, TurnEvent};
use crate::archive::{Archive, ArchiveRecord, MemoryArchive};
use crate::bus::{Bus, BusMessage, Qos};
use crate::config::{BusConfig, Config};
use crate::providers::{OllamaBackend, OllamaEmbedder};
use crate::session::HistoryStore;
use crate::tools::{PublishTool, RecallTool, ScrapeTool, SearchTool, ToolRegistry};
use crate::topic::system_filter;

#[derive(Debug, Parser)]
#[command(name = "tachikoma", version, about = "Interruptible agents on a publish/subscribe bus")]
pub struct Cli {
    /// Config file (default: ~/.tachikoma/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "TACHIKOMA_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an agent
    Agent {
        /// Generation model
        #[arg(long)]
        model: Option<String>,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Speaker id on the bus
        #[arg(long)]
        speaker: Option<String>,
        /// Discard saved history before starting
        #[arg(long)]
        clear: bool,
    },
    /// Chat from the terminal
    User {
        #[arg(long)]
        speaker: Option<String>,
    },
    /// Archive channel traffic
    Archive,
    /// Publish a raw message
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
        /// QoS level 0, 1 or 2
        #[arg(long, default_value_t = 0)]
        qos: u8,
    },
    /// Print raw messages matching a topic filter
    Subscribe {
        #[arg(long, default_value = "#")]
        topic: String,
    },
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Agent {
            model,
            system,
            speaker,
            clear,
        } => {
            if let Some(model) = model {
                config.backend.model = model;
            }
            if let Some(system) = system {
                config.agent.system_prompt = system;
            }
            if let Some(speaker) = speaker {
                config.agent.speaker_id = speaker;
            }
            config.validate()?;
            run_agent(config, clear).await
        }
        Command::User { speaker } => {
            if let Some(speaker) = speaker {
                config.agent.user_id = speaker;
            }
            user::run(config).await
        }
        Command::Archive => run_archive(config).await,
        Command::Publish {
            topic,
            payload,
            qos,
        } => {
            let qos = Qos::from_level(qos)?;
            let (bus, _inbound) = connect_bus(&config.bus)?;
            bus.publish(&topic, payload.into_bytes(), qos)
                .await
                .context("publish failed")?;
            info!(topic = %topic, "Published");
            bus.disconnect().await?;
            Ok(())
        }
        Command::Subscribe { topic } => {
            let (bus, mut inbound) = connect_bus(&config.bus)?;
            bus.subscribe(&topic, Qos::AtMostOnce).await?;
            let shutdown = shutdown_on_ctrl_c();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = inbound.recv() => match received {
                        Some(message) => println!("{}", message),
                        None => break,
                    },
                }
            }
            bus.disconnect().await?;
            Ok(())
        }
    }
}

#[cfg(feature = "mqtt")]
pub(crate) fn connect_bus(
    config: &BusConfig,
) -> Result<(Arc<dyn Bus>, mpsc::UnboundedReceiver<BusMessage>)> {
    let (bus, inbound) = crate::bus::MqttBus::connect(config);
    Ok((Arc::new(bus), inbound))
}

#[cfg(not(feature = "mqtt"))]
pub(crate) fn connect_bus(
    _config: &BusConfig,
) -> Result<(Arc<dyn Bus>, mpsc::UnboundedReceiver<BusMessage>)> {
    anyhow::bail!("built without MQTT support; rebuild with `--features mqtt`")
}

pub(crate) fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        trigger.cancel();
    });
    token
}

fn build_tools(config: &Config, bus: Arc<dyn Bus>, archive: Arc<dyn Archive>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ScrapeTool::new(config.tools.scrape_max_chars)));
    tools.register(Box::new(PublishTool::new(bus)));
    tools.register(Box::new(RecallTool::new(archive, config.tools.recall_limit)));
    match (&config.tools.google_api_key, &config.tools.google_cse_id) {
        (Some(key), Some(cx)) => tools.register(Box::new(SearchTool::new(key, cx))),
        _ => info!("GOOGLE_API_KEY / GOOGLE_CSE_ID not set, search tool disabled"),
    }
    tools
}

async fn run_agent(config: Config, clear: bool) -> Result<()> {
    let speaker = config.agent.speaker_id.clone();
    let (bus, mut bus_inbound) = connect_bus(&config.bus)?;
    let backend = Arc::new(OllamaBackend::new(&config.backend.base_url, &config.backend.model));
    let embedder = Arc::new(OllamaEmbedder::new(
        &config.backend.base_url,
        &config.backend.embedding_model,
    ));
    let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new(embedder));

    let store = HistoryStore::new().context("failed to open history store")?;
    if clear {
        store.clear(&speaker).await?;
    }
    let history = store.load(&speaker, config.agent.history_limit).await?;

    // Every message the agent sees is also remembered for `recall`.
    let template = config.topic_template()?;
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let tap_archive = Arc::clone(&archive);
    tokio::spawn(async move {
        while let Some(message) = bus_inbound.recv().await {
            let record = ArchiveRecord::from_bus(&template, &message);
            if inbound_tx.send(message).is_err() {
                break;
            }
            let archive = Arc::clone(&tap_archive);
            tokio::spawn(async move {
                if let Err(e) = archive.ingest(record).await {
                    warn!(error = %e, "Failed to archive message");
                }
            });
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_turns(events_rx));

    let tools = build_tools(&config, Arc::clone(&bus), archive);
    let run_loop = RunLoop::new(&config, Arc::clone(&bus), backend)?
        .with_tools(tools)
        .with_history(store, history)
        .with_events(events_tx)
        .with_shutdown(shutdown_on_ctrl_c());

    let conversation = run_loop.run(inbound).await.context("agent loop failed")?;
    info!(speaker = %speaker, messages = conversation.len(), "Agent stopped");
    bus.disconnect().await?;
    Ok(())
}

/// Live console sink for streamed replies.
async fn print_turns(mut events: mpsc::UnboundedReceiver<TurnEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::Content(text) => {
                let _ = write!(stdout, "{}", text);
                let _ = stdout.flush();
            }
            TurnEvent::Published(_) => println!(),
            TurnEvent::Aborted { .. } => println!(" [interrupted]"),
            TurnEvent::PublishFailed(reason) => println!(" [not delivered: {}]", reason),
            TurnEvent::GenerationFailed(reason) => println!("[failed: {}]", reason),
            TurnEvent::ToolDispatched { name, found } => {
                if found {
                    println!("[tool {}]", name);
                }
            }
            TurnEvent::Submitted { .. } => {}
        }
    }
}

async fn run_archive(config: Config) -> Result<()> {
    let template = config.topic_template()?;
    let (bus, mut inbound) = connect_bus(&config.bus)?;
    bus.subscribe(
        &template.channel_filter(&config.bus.namespace, &config.bus.channel),
        Qos::AtMostOnce,
    )
    .await?;
    bus.subscribe(&system_filter(&config.bus.namespace), Qos::ExactlyOnce)
        .await?;

    let embedder = Arc::new(OllamaEmbedder::new(
        &config.backend.base_url,
        &config.backend.embedding_model,
    ));
    let archive = MemoryArchive::new(embedder);
    let shutdown = shutdown_on_ctrl_c();
    info!(channel = %config.bus.channel, "Archiver started");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = inbound.recv() => match received {
                Some(message) => message,
                None => break,
            },
        };
        let record = ArchiveRecord::from_bus(&template, &message);
        let speaker = record.tuple.speaker_id.clone();
        match archive.ingest(record).await {
            Ok(()) => info!(topic = %message.topic, speaker = %speaker, "Archived"),
            Err(e) => warn!(topic = %message.topic, error = %e, "Failed to archive"),
        }
    }

    info!(records = archive.len().await, "Archiver stopped");
    bus.disconnect().await?;
    Ok(())
}
