use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

fn redact_host(url: &str) -> String {
    url.split('@')
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("?")
        .to_string()
}

use futures_oms::{
    client::{ClientEvent, OmsClient},
    instruments::InstrumentRepository,
    ledger::Ledger,
    monitoring,
    proxy::Proxy,
    server::Oms,
    types::AppConfig,
};

#[derive(Parser, Debug)]
#[command(name = "futures-oms")]
#[command(about = "Order management server between strategy clients and broker gateways", long_about = None)]
struct Cli {
    /// OMS configuration file(s). When several are given their contents are
    /// merged; a file that appears later in the list overrides those that
    /// come in front.
    #[arg(short, long, default_value = "config/oms.toml", num_args = 1..)]
    config: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the transport proxy and the OMS core
    Run {},
    /// Log in as a one-shot client and print the position tree
    Probe {
        #[arg(long, default_value = "probe")]
        session: String,
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "probe")]
        strategy: String,
        #[arg(long, default_value = "main")]
        portfolio: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "futures_oms=debug,oms=debug,info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(target: "oms", "futures-oms starting");

    let cli = Cli::parse();
    tracing::debug!(target: "oms", config = ?cli.config, "loading config");

    let cfg = AppConfig::from_files(&cli.config)?;
    tracing::info!(
        target: "oms",
        brokers = cfg.brokers.len(),
        frontend = %cfg.messaging.frontend,
        backend = %cfg.messaging.backend,
        postgres_host = redact_host(&cfg.postgres.url),
        "config loaded"
    );

    match cli.command.unwrap_or(Commands::Run {}) {
        Commands::Run {} => {
            monitoring::logger::log_startup(&cfg);
            run_server(cfg).await?;
        }
        Commands::Probe {
            session,
            account,
            strategy,
            portfolio,
        } => {
            run_probe(&cfg, &session, &account, &strategy, &portfolio).await?;
        }
    }

    Ok(())
}

async fn run_server(cfg: AppConfig) -> anyhow::Result<()> {
    let proxy = Proxy::bind(&cfg.messaging.frontend, &cfg.messaging.backend).await?;
    tokio::spawn(async move {
        if let Err(err) = proxy.run().await {
            tracing::error!(target: "proxy", error = %err, "proxy stopped");
        }
    });

    let ledger = Ledger::connect(&cfg.postgres).await?;
    tracing::info!(target: "oms", "ledger connected");
    let instruments = InstrumentRepository::from_file(&cfg.instruments.path)?;
    tracing::info!(
        target: "oms",
        count = instruments.instruments().len(),
        "instrument repository loaded"
    );

    let oms = Oms::new(&cfg, ledger, instruments)?;
    let runner = {
        let oms = oms.clone();
        tokio::spawn(async move { oms.run().await })
    };

    tokio::select! {
        result = runner => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "oms", "interrupt received");
        }
    }

    oms.shutdown().await;
    Ok(())
}

async fn run_probe(
    cfg: &AppConfig,
    session: &str,
    account: &str,
    strategy: &str,
    portfolio: &str,
) -> anyhow::Result<()> {
    let url = format!("ws://{}", cfg.messaging.frontend);
    let strategies: BTreeMap<String, String> =
        [(strategy.to_string(), portfolio.to_string())].into();

    let mut client = OmsClient::connect(url, session, account, strategies);
    tokio::time::timeout(Duration::from_secs(30), client.wait_till_ready())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for OMS login"))?;
    client.request_position();

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            maybe = client.events().recv() => {
                match maybe {
                    Some(ClientEvent::Position { account, .. }) => {
                        println!("{}", serde_json::to_string_pretty(&account)?);
                        break;
                    }
                    Some(ClientEvent::Error { error_code, message, .. }) => {
                        anyhow::bail!("OMS error {}: {message}", u16::from(error_code));
                    }
                    Some(_) => {}
                    None => anyhow::bail!("client event stream closed"),
                }
            }
            _ = &mut deadline => {
                anyhow::bail!("timed out waiting for the position reply");
            }
        }
    }
    Ok(())
}
