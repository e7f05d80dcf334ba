//! fallwatchd - fall detection stream daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment overrides)
//! 2. Builds the detector registry and the alert notifier (MQTT or log)
//! 3. Serves annotated MJPEG streams and the recent-falls API over HTTP
//!
//! With `--once <source>` it instead runs a single session over the given source,
//! waits for its alerts, and exits.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use fallwatch::{
    BackendRegistry, FallServer, FallwatchConfig, LogNotifier, MqttNotifier, Notifier,
    ServerConfig, SessionRequest, SessionRunner, SourceDescriptor, StreamEnd,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fall detection stream daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "FALLWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Default source for `/stream` (file path, device index, URL or stub://).
    #[arg(long)]
    source: Option<String>,

    /// Viewer server listen address.
    #[arg(long)]
    addr: Option<String>,

    /// Process one source and exit instead of serving.
    #[arg(long, value_name = "SOURCE")]
    once: Option<String>,

    /// With --once, write the annotated MJPEG stream here.
    #[arg(long, value_name = "PATH", requires = "once")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = FallwatchConfig::load_from(args.config.as_deref())?;
    if let Some(source) = &args.source {
        config.source.default = source.clone();
    }
    if let Some(addr) = &args.addr {
        config.server_addr = addr.clone();
    }

    let registry = BackendRegistry::from_settings(&config.detector)?;
    log::info!(
        "detector backends: {:?} (default {})",
        registry.list(),
        registry.default_name().unwrap_or("none")
    );

    let mqtt = match &config.alerts.mqtt {
        Some(settings) => Some(Arc::new(MqttNotifier::connect(settings)?)),
        None => None,
    };
    let notifier: Arc<dyn Notifier> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => Arc::new(LogNotifier),
    };
    log::info!(
        "alerts via {} (cooldown {}s, handoff {:?}, shared cooldown: {})",
        notifier.name(),
        config.alerts.cooldown.as_secs(),
        config.alerts.handoff,
        config.alerts.shared_cooldown
    );

    let sessions = Arc::new(SessionRunner::new(&config, registry, notifier)?);
    log::info!(
        "evidence: images in {}, log at {}",
        config.evidence.dir.display(),
        config.evidence.log_path.display()
    );

    let result = match &args.once {
        Some(source) => run_once(&sessions, source, args.output.as_ref()),
        None => serve(&config, sessions),
    };

    if let Some(mqtt) = mqtt {
        if let Err(err) = mqtt.disconnect() {
            log::warn!("MQTT disconnect failed: {}", err);
        }
    }
    result
}

fn serve(config: &FallwatchConfig, sessions: Arc<SessionRunner>) -> Result<()> {
    let server_config = ServerConfig {
        addr: config.server_addr.clone(),
        default_source: SourceDescriptor::parse(&config.source.default)?,
    };
    let handle = FallServer::new(server_config, sessions).spawn()?;
    log::info!("fallwatchd running. viewer at http://{}/stream", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("fallwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping viewer server...");
    handle.stop()
}

fn run_once(sessions: &SessionRunner, source: &str, output: Option<&PathBuf>) -> Result<()> {
    let descriptor = SourceDescriptor::parse(source)?;
    let source_id = match &descriptor {
        SourceDescriptor::File(_) => "uploaded".to_string(),
        SourceDescriptor::Device(_) => "local".to_string(),
        other => other.to_string(),
    };
    let request = SessionRequest::new(descriptor, &source_id).waiting_for_alerts();

    let report = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("create output {}", path.display()))?;
            let mut out = BufWriter::new(file);
            let report = sessions.run(&request, &mut out);
            out.flush()?;
            report
        }
        None => sessions.run(&request, &mut io::sink()),
    };

    log::info!(
        "{}: {} frames sent, {} dropped, {} alerts ({:?})",
        report.source_id,
        report.stream.frames_sent,
        report.stream.frames_dropped,
        report.stream.alerts_dispatched,
        report.dispatches
    );
    match report.end {
        StreamEnd::Exhausted => Ok(()),
        other => Err(anyhow!("stream ended early: {}", other)),
    }
}
