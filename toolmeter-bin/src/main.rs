use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use toolmeter_core::{
    attribution::RequestIdentity,
    budget::{BudgetGate, VirtualKey},
    config::Config,
    http_client::HttpClient,
    ingest::IngestEngine,
    metering::sink_from_config,
    model::{ChatMessage, ChatRequest, Role},
    provider_factory::ProviderRegistry,
    proxy::{CompletionProxy, ProxyCall},
    router::RoutingResolver,
    store::SqliteStore,
    stream::DeltaAccumulator,
    synth::SpanSynthesizer,
    telemetry::TraceBatch,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "toolmeter CLI smoke tool", long_about = None)]
struct Cli {
    /// JSON or TOML config; without one everything routes to the null provider.
    #[arg(long, env = "TOOLMETER_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides `storage.database_url`.
    #[arg(long, env = "TOOLMETER_DATABASE_URL")]
    database: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Virtual key as JSON. Defaults to an unlimited key for `--tenant`.
    #[arg(long)]
    key: Option<PathBuf>,
    #[arg(long, default_value = "local")]
    tenant: String,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an OTLP/JSON trace export
    Ingest {
        file: PathBuf,
        /// User id to fall back on when the telemetry carries none
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        team: Option<String>,
    },
    /// Send a chat completion through the proxy path
    Chat {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        provider: Option<String>,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Stream a chat completion (prints deltas live)
    ChatStream {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        provider: Option<String>,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Evaluate a virtual key against its budget
    Budget {
        key: PathBuf,
        #[arg(long)]
        model: Option<String>,
    },
}

fn load_key(path: &Path) -> anyhow::Result<VirtualKey> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl KeyArgs {
    fn resolve(&self) -> anyhow::Result<VirtualKey> {
        let mut key = match &self.key {
            Some(path) => load_key(path)?,
            None => VirtualKey::unlimited("cli", &self.tenant),
        };
        if self.user.is_some() {
            key.user_id = self.user.clone();
        }
        Ok(key)
    }
}

struct App {
    engine: Arc<IngestEngine>,
    proxy: CompletionProxy,
}

async fn build(cfg: &Config) -> anyhow::Result<App> {
    let store = Arc::new(SqliteStore::open(&cfg.storage).await?);
    let http = HttpClient::from_cfg(&cfg.http)?;
    let metering = sink_from_config(&cfg.metering, http, |var| std::env::var(var).ok());
    let engine = Arc::new(IngestEngine::new(store.clone(), store, metering));

    let registry = Arc::new(ProviderRegistry::from_config(cfg)?);
    let router = Arc::new(RoutingResolver::new(cfg)?);
    let synth = Arc::new(SpanSynthesizer::new(cfg.limits));
    let proxy = CompletionProxy::new(engine.clone(), synth, registry, router);
    Ok(App { engine, proxy })
}

fn user_says(model: &str, message: &str) -> ChatRequest {
    ChatRequest::new(model, vec![ChatMessage::new(Role::User, message)])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::offline(),
    };
    if let Some(url) = cli.database {
        cfg.storage.database_url = url;
    }

    match cli.command {
        Commands::Budget { key, model } => {
            let key = load_key(&key)?;
            let now = chrono::Utc::now();
            let decision = BudgetGate::evaluate(&key, now);
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if let Some(model) = model {
                match BudgetGate::authorize(&key, &model, now) {
                    Ok(_) => println!("{model}: allowed"),
                    Err(e) => println!("{model}: {e}"),
                }
            }
        }
        Commands::Ingest { file, user, team } => {
            let app = build(&cfg).await?;
            let raw = std::fs::read_to_string(&file)?;
            let batch: TraceBatch = serde_json::from_str(&raw)?;
            let identity = RequestIdentity {
                user_id: user,
                team_id: team,
            };
            let outcome = app.engine.ingest(&batch, &identity).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Chat {
            model,
            message,
            provider,
            key,
        } => {
            let app = build(&cfg).await?;
            let call = ProxyCall {
                key: key.resolve()?,
                provider,
                request: user_says(&model, &message),
            };
            let resp = app.proxy.complete(call).await?;
            let text = resp.first_message().map(|m| m.text()).unwrap_or_default();
            println!("{} -> {}", resp.model, text);
        }
        Commands::ChatStream {
            model,
            message,
            provider,
            key,
        } => {
            use std::io::{self, Write};

            let app = build(&cfg).await?;
            let call = ProxyCall {
                key: key.resolve()?,
                provider,
                request: user_says(&model, &message),
            };
            let mut streamed = app.proxy.complete_stream(call).await?;

            // A second reducer only to print deltas as they arrive.
            let mut shown = DeltaAccumulator::new();
            let mut printed = 0;
            while let Some(line) = streamed.lines.next().await {
                match line {
                    Ok(line) => {
                        shown.push_line(&line.line);
                        let content = shown.content();
                        if content.len() > printed {
                            print!("{}", &content[printed..]);
                            io::stdout().flush().ok();
                            printed = content.len();
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "stream failed");
                        break;
                    }
                }
            }
            if printed > 0 {
                println!();
            }
            if let Some(usage) = shown.usage() {
                tracing::info!(total_tokens = usage.total(), "usage");
            }
            let receipt = streamed.recorded.await??;
            tracing::info!(spans = receipt.inserted_spans, "exchange recorded");
        }
    }

    Ok(())
}
