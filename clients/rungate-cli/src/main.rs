//! rungate - command line client for the schema broker

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rungate::schema::parse_sdl;
use rungate::{
    Announcer, AnnouncerConfig, BrokerClient, Criticality, DeregisterRequest, RegisterRequest,
    ServiceEntry, check_compatibility, git_revision, shutdown_signal,
};

const DEFAULT_BROKER_URL: &str = "http://localhost:3001";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Broker URL
    #[arg(short, long, env = "SERVICE_GATEWAY_URL", default_value = DEFAULT_BROKER_URL)]
    broker: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register one instance of a service version
    Register {
        #[arg(long)]
        name: String,

        /// GraphQL endpoint the broker introspects and the gateway calls
        #[arg(long)]
        url: String,

        /// Version hash (defaults to the checked out git revision)
        #[arg(long)]
        hash: Option<String>,

        #[arg(long, default_value = "main")]
        gateway: String,
    },

    /// Deregister one instance of a service version
    Deregister {
        #[arg(long)]
        name: String,

        /// Version hash (defaults to the checked out git revision)
        #[arg(long)]
        hash: Option<String>,

        #[arg(long, default_value = "main")]
        gateway: String,
    },

    /// Show the active services of a gateway
    Schemas {
        #[arg(default_value = "main")]
        gateway: String,

        /// Show the staged successor of this active hash instead
        #[arg(long)]
        triage: Option<String>,

        /// Print the SDL of each service
        #[arg(long)]
        sdl: bool,
    },

    /// Register from SERVICE_* variables, deregister on SIGTERM / Ctrl+C
    Announce,

    /// Compare two SDL files the way the broker gates a rollout
    Check {
        previous: PathBuf,
        candidate: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Register {
            name,
            url,
            hash,
            gateway,
        } => cmd_register(&cli, name, url, hash.as_deref(), gateway).await,
        Commands::Deregister {
            name,
            hash,
            gateway,
        } => cmd_deregister(&cli, name, hash.as_deref(), gateway).await,
        Commands::Schemas {
            gateway,
            triage,
            sdl,
        } => cmd_schemas(&cli, gateway, triage.as_deref(), *sdl).await,
        Commands::Announce => cmd_announce().await,
        Commands::Check {
            previous,
            candidate,
        } => cmd_check(previous, candidate),
    }
}

fn resolve_hash(hash: Option<&str>) -> Result<String> {
    match hash {
        Some(hash) => Ok(hash.to_string()),
        None => {
            let cwd = std::env::current_dir()?;
            git_revision(&cwd).context("No --hash given and no git revision found")
        }
    }
}

async fn cmd_register(
    cli: &Cli,
    name: &str,
    url: &str,
    hash: Option<&str>,
    gateway: &str,
) -> Result<()> {
    let hash = resolve_hash(hash)?;
    println!(
        "{}",
        format!("Registering {} ({}) with gateway {}...", name, hash, gateway).green()
    );

    let client = BrokerClient::new(&cli.broker);
    let response = client
        .register(&RegisterRequest {
            name: name.to_string(),
            url: url.to_string(),
            hash,
            gateway: gateway.to_string(),
        })
        .await
        .context("Registration failed")?;

    println!("{}", "Registered!".green().bold());
    println!("  Outcome: {}", format!("{:?}", response.outcome).cyan());
    println!("  Hash:    {}", response.hash);
    Ok(())
}

async fn cmd_deregister(cli: &Cli, name: &str, hash: Option<&str>, gateway: &str) -> Result<()> {
    let hash = resolve_hash(hash)?;
    println!(
        "{}",
        format!("Deregistering {} ({}) from gateway {}...", name, hash, gateway).yellow()
    );

    let client = BrokerClient::new(&cli.broker);
    let response = client
        .deregister(&DeregisterRequest {
            name: name.to_string(),
            hash,
            gateway: gateway.to_string(),
            url: None,
        })
        .await
        .context("Deregistration failed")?;

    println!("{}", "Deregistered!".green().bold());
    println!("  Outcome: {}", format!("{:?}", response.outcome).cyan());
    if let Some(promoted) = response.promoted {
        println!("  Promoted: {}", promoted.green());
    }
    Ok(())
}

async fn cmd_schemas(cli: &Cli, gateway: &str, triage: Option<&str>, sdl: bool) -> Result<()> {
    let client = BrokerClient::new(&cli.broker);

    if let Some(parent) = triage {
        match client.triage(gateway, parent).await? {
            Some(entry) => {
                println!("{}", format!("Staged successor of {}:", parent).cyan().bold());
                print_entry(&entry, sdl);
            }
            None => println!("{}", format!("No rollout staged for {}.", parent).yellow()),
        }
        return Ok(());
    }

    let services = client
        .schemas(gateway)
        .await
        .with_context(|| format!("Failed to fetch services of gateway {}", gateway))?;

    if services.is_empty() {
        println!("{}", "No services registered.".yellow());
        return Ok(());
    }

    println!("{}", format!("Gateway {}:", gateway).cyan().bold());
    for entry in &services {
        print_entry(entry, sdl);
    }
    Ok(())
}

fn print_entry(entry: &ServiceEntry, sdl: bool) {
    println!("  {} [{}] - {}", entry.name.bold(), entry.hash, entry.url);
    if let Some(parent) = &entry.parent_hash {
        println!("    replaces {}", parent);
    }
    if sdl {
        for line in entry.schema.lines() {
            println!("    {}", line.dimmed());
        }
    }
}

async fn cmd_announce() -> Result<()> {
    let config = AnnouncerConfig::from_env().context("Incomplete SERVICE_* environment")?;
    let announcer = Announcer::new(config);

    let response = announcer.announce().await.context("Announce failed")?;
    println!(
        "{}",
        format!(
            "Announced {} ({}) to {}: {:?}",
            response.name, response.hash, response.gateway, response.outcome
        )
        .green()
    );

    shutdown_signal().await;

    let response = announcer.withdraw().await.context("Withdraw failed")?;
    println!(
        "{}",
        format!(
            "Withdrew {} ({}): {:?}",
            response.name, response.hash, response.outcome
        )
        .yellow()
    );
    if let Some(promoted) = response.promoted {
        println!("  Promoted: {}", promoted.green());
    }
    Ok(())
}

fn cmd_check(previous: &Path, candidate: &Path) -> Result<()> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    };
    let previous_sdl = read(previous)?;
    let candidate_sdl = read(candidate)?;

    let previous = parse_sdl("previous", &previous_sdl)?;
    let candidate = parse_sdl("candidate", &candidate_sdl)?;
    let report = check_compatibility(&previous, &candidate);

    if report.changes.is_empty() {
        println!("{}", "No changes.".green());
        return Ok(());
    }

    for change in &report.changes {
        let label = match change.criticality {
            Criticality::Breaking => format!("{:<10}", "BREAKING").red().bold(),
            Criticality::Dangerous => format!("{:<10}", "DANGEROUS").yellow(),
            Criticality::Safe => format!("{:<10}", "SAFE").green(),
        };
        println!("  {} {} - {}", label, change.path, change.message);
    }

    if report.is_breaking() {
        bail!(
            "{} breaking change(s); a rollout would be staged",
            report.breaking().count()
        );
    }
    Ok(())
}
