use std::{io::Write as _, path::PathBuf, process};

use bitcoin::{Amount, Denomination};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pool_disburser::{
    client::{Auth, Client},
    config::Config,
    driver::{AutoDriver, InteractiveDriver, Selector},
    engine::Engine,
    journal::Journal,
    pool::PoolClient,
    preflight,
    traits::{PoolApi, Reader},
    types::{Obligation, PaymentResult, PaymentStatus},
};

/// Exit code for preflight and configuration failures.
const EXIT_PREFLIGHT: i32 = 1;
/// Exit code for fatal engine errors.
const EXIT_ENGINE: i32 = 2;

#[derive(Parser)]
#[command(
    name = "pool-disburser",
    version,
    about = "Pays a mining pool's pending obligations on chain"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "disburser.toml")]
    config: PathBuf,

    /// Select and confirm batches by hand instead of the automated loop.
    #[arg(long)]
    interactive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run preflight checks, then disburse (the default).
    Run,
    /// Probe the chain node and the pool api, then exit.
    SelfTest,
    /// Print the completion journal.
    Journal,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(%e, "Configuration error");
            process::exit(EXIT_PREFLIGHT);
        }
    };

    let auth = if config.chain.rpc_user.is_empty() {
        Auth::None
    } else {
        Auth::UserPass(
            config.chain.rpc_user.clone(),
            config.chain.rpc_password.clone(),
        )
    };
    let chain = match Client::new(
        config.chain.rpc_url.clone(),
        auth,
        Some(config.chain.rpc_timeout()),
        None,
        None,
    ) {
        Ok(client) => client.with_wallet_signing(config.chain.use_wallet_signing),
        Err(e) => {
            error!(%e, "Could not create the chain rpc client");
            process::exit(EXIT_PREFLIGHT);
        }
    };
    chain.set_wallet(Some(config.chain.wallet_name.clone()));

    let pool = match PoolClient::new(
        config.pool.api_base_url.clone(),
        &config.pool.api_key,
        Some(config.pool.request_timeout()),
    ) {
        Ok(client) => client,
        Err(e) => {
            error!(%e, "Could not create the pool api client");
            process::exit(EXIT_PREFLIGHT);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::SelfTest => self_test(&chain, &pool).await,
        Command::Journal => dump_journal(&config).await,
        Command::Run => run(cli.interactive, config, chain, pool).await,
    }
}

async fn run(interactive: bool, config: Config, chain: Client, pool: PoolClient) {
    if let Err(e) = preflight::run(&chain, &pool, &config).await {
        error!(%e, "Preflight failed");
        process::exit(EXIT_PREFLIGHT);
    }

    let journal = match Journal::open(&config.journal.path).await {
        Ok(journal) => journal,
        Err(e) => {
            error!(%e, "Could not open the completion journal");
            process::exit(EXIT_PREFLIGHT);
        }
    };
    let engine = Engine::new(chain, pool, journal, config.engine_config());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    if config.automation.enabled && !interactive {
        let driver = AutoDriver::new(engine, config.automation_config());
        if let Err(e) = driver.run(cancel).await {
            error!(%e, "Fatal engine error");
            process::exit(EXIT_ENGINE);
        }
        let stats = driver.status().await;
        info!(
            batches = stats.batches_run,
            succeeded = stats.payments_succeeded,
            partial = stats.payments_partial,
            failed = stats.payments_failed,
            total_paid = %coins(stats.total_paid),
            "Session finished"
        );
    } else {
        let driver = InteractiveDriver::new(engine, ConsoleSelector);
        while !cancel.is_cancelled() {
            match driver.run_once(&cancel).await {
                Ok(Some(results)) => print_results(&results),
                Ok(None) => break,
                Err(e) => {
                    error!(%e, "Fatal engine error");
                    process::exit(EXIT_ENGINE);
                }
            }
        }
    }
}

async fn self_test(chain: &Client, pool: &PoolClient) {
    let chain_ok = chain.test_connection().await;
    println!(
        "chain node: {}",
        if chain_ok { "ok" } else { "unreachable" }
    );
    let pool_ok = pool.test_connection().await;
    println!("pool api:   {}", if pool_ok { "ok" } else { "unreachable" });
    if !(chain_ok && pool_ok) {
        process::exit(EXIT_PREFLIGHT);
    }
}

async fn dump_journal(config: &Config) {
    let journal = match Journal::open(&config.journal.path).await {
        Ok(journal) => journal,
        Err(e) => {
            error!(%e, "Could not open the completion journal");
            process::exit(EXIT_PREFLIGHT);
        }
    };
    for entry in journal.snapshot().await {
        println!(
            "{:>10}  {}  {}",
            entry.obligation_id,
            entry.transaction_id,
            entry.completed_at.to_rfc3339()
        );
    }
}

fn print_results(results: &[PaymentResult]) {
    for result in results {
        let line = format!(
            "{:>10}  {:<17}  {:>16}  {}",
            result.obligation_id,
            result.status.to_string(),
            coins(result.completed_amount),
            result.transaction_ids.join(",")
        );
        match result.status {
            PaymentStatus::Failed => {
                println!("{line}  {}", result.error.as_deref().unwrap_or(""))
            }
            _ => println!("{line}"),
        }
    }
}

fn coins(amount: Amount) -> String {
    amount.to_string_in(Denomination::Bitcoin)
}

/// Line-oriented operator dialogue on stdin/stdout.
struct ConsoleSelector;

impl Selector for ConsoleSelector {
    async fn choose(&self, pending: &[Obligation]) -> std::io::Result<Vec<u64>> {
        println!("Pending payments:");
        for o in pending {
            println!(
                "  {:>10}  {:>16}  {}  {}",
                o.id,
                coins(o.amount),
                o.address,
                o.created_at.to_rfc3339()
            );
        }
        print!("Pay which ids? (comma separated, 'all', empty to quit): ");
        std::io::stdout().flush()?;
        let line = read_line().await?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        if line.eq_ignore_ascii_case("all") {
            return Ok(pending.iter().map(|o| o.id).collect());
        }
        let mut ids = Vec::new();
        for token in line.split([',', ' ']).filter(|t| !t.is_empty()) {
            match token.parse::<u64>() {
                Ok(id) => ids.push(id),
                Err(_) => eprintln!("ignoring {token:?}"),
            }
        }
        Ok(ids)
    }

    async fn confirm(&self, chosen: &[Obligation]) -> std::io::Result<bool> {
        let total: u64 = chosen.iter().map(|o| o.amount.to_sat()).sum();
        print!(
            "Pay {} obligations totalling {}? [y/N] ",
            chosen.len(),
            coins(Amount::from_sat(total))
        );
        std::io::stdout().flush()?;
        let line = read_line().await?;
        Ok(matches!(line.trim(), "y" | "Y" | "yes"))
    }
}

async fn read_line() -> std::io::Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .map_err(std::io::Error::other)?
}
