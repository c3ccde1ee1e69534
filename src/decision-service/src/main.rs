//! Decision Service: local contextual-bandit decisions with batched event upload.
//!
//! Reads JSON-lines commands on stdin and answers each `choose` with the
//! selected action on stdout. Logs go to stderr.

use clap::Parser;
use decision_client::{
    DecisionClient, HttpModelSource, HttpSettingsSource, ModelSource, NoOpPollObserver,
    SettingsSource,
};
use decision_core::config::AppConfig;
use decision_core::types::Action;
use decision_predictor::LinearPolicyEngine;
use decision_uploader::{HttpTransport, NoOpObserver};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "decision-service")]
#[command(about = "Contextual-bandit decision client with batched event upload")]
#[command(version)]
struct Cli {
    /// Client identifier (overrides config)
    #[arg(long, env = "DECISION_SERVICE__CLIENT_ID")]
    client_id: Option<String>,

    /// Upload endpoint (overrides config)
    #[arg(long, env = "DECISION_SERVICE__UPLOAD__ENDPOINT")]
    endpoint: Option<String>,

    /// Model file loaded before serving (overrides config)
    #[arg(long, env = "DECISION_SERVICE__PREDICTOR__INITIAL_MODEL_PATH")]
    model: Option<String>,

    /// Maximum concurrent model workers (overrides config)
    #[arg(long, env = "DECISION_SERVICE__PREDICTOR__MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "DECISION_SERVICE__METRICS__PORT")]
    metrics_port: Option<u16>,
}

/// One stdin command.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Command {
    Choose {
        key: String,
        context: Value,
        #[serde(default)]
        default: Option<Action>,
    },
    Reward {
        key: String,
        value: f64,
    },
    Outcome {
        key: String,
        value: Value,
    },
}

fn handle(client: &DecisionClient, command: Command) -> Value {
    match command {
        Command::Choose {
            key,
            context,
            default,
        } => {
            let result = match default {
                Some(default) => client.choose_action_or(&key, context, default),
                None => client.choose_action(&key, context),
            };
            match result {
                Ok(action) => json!({ "key": key, "action": action }),
                Err(e) => json!({ "key": key, "error": e.to_string() }),
            }
        }
        Command::Reward { key, value } => {
            json!({ "key": key, "queued": client.report_reward(&key, value) })
        }
        Command::Outcome { key, value } => {
            json!({ "key": key, "queued": client.report_outcome(&key, value) })
        }
    }
}

fn refresh_sources(
    config: &AppConfig,
) -> anyhow::Result<(Option<Arc<dyn ModelSource>>, Option<Arc<dyn SettingsSource>>)> {
    let timeout = Duration::from_millis(config.refresh.request_timeout_ms);
    let model = match &config.refresh.model_url {
        Some(url) => Some(Arc::new(HttpModelSource::new(url, timeout)?) as Arc<dyn ModelSource>),
        None => None,
    };
    let settings = match &config.refresh.settings_url {
        Some(url) => {
            Some(Arc::new(HttpSettingsSource::new(url, timeout)?) as Arc<dyn SettingsSource>)
        }
        None => None,
    };
    Ok((model, settings))
}

async fn serve(client: &DecisionClient) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let line = tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupt received");
                return Ok(());
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Input closed");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle(client, command),
            Err(e) => {
                warn!(error = %e, "Unparseable command");
                json!({ "error": e.to_string() })
            }
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "decision_service=info,decision_client=info,decision_uploader=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    info!("Decision Service starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }
    if let Some(endpoint) = cli.endpoint {
        config.upload.endpoint = endpoint;
    }
    if let Some(model) = cli.model {
        config.predictor.initial_model_path = Some(model);
    }
    if let Some(max_workers) = cli.max_workers {
        config.predictor.max_workers = max_workers;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = Some(port);
    }

    info!(
        client_id = %config.client_id,
        endpoint = %config.upload.endpoint,
        max_workers = config.predictor.max_workers,
        "Configuration loaded"
    );

    if let Some(port) = config.metrics.port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()?;
        info!(port, "Metrics exporter started");
    }

    let transport = Arc::new(HttpTransport::new(&config.upload)?);
    let (model_source, settings_source) = refresh_sources(&config)?;
    let initial_model = config.predictor.initial_model_path.clone();

    let client = DecisionClient::new(
        config,
        Arc::new(LinearPolicyEngine),
        transport,
        Arc::new(NoOpObserver),
    )?;

    if let Some(path) = initial_model {
        match tokio::fs::read(&path).await {
            Ok(bytes) => match client.update_model(&bytes) {
                Ok(version) => info!(path = %path, version = %version, "Initial model loaded"),
                Err(e) => error!(path = %path, error = %e, "Initial model rejected"),
            },
            Err(e) => error!(path = %path, error = %e, "Failed to read initial model"),
        }
    }

    if model_source.is_some() || settings_source.is_some() {
        client.start_refresh(model_source, settings_source, Arc::new(NoOpPollObserver));
    }

    info!("Decision Service is ready");

    let served = serve(&client).await;
    let stats = client.shutdown().await;
    info!(
        delivered = stats.events_delivered,
        failed = stats.events_failed,
        dropped = stats.events_dropped,
        "Decision Service stopped"
    );
    served
}
