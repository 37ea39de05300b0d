// Cirrus node firewall agent. Single binary: the long-running reconcile
// agent plus a one-shot recovery command for operators.

mod agent;
mod firewall;
mod netfilter;
mod store;
mod utils;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agent::config::AgentConfig;
use agent::Agent;
use utils::logger::Logger;

/// Cirrus - Hypervisor node firewall agent
#[derive(Parser, Debug)]
#[clap(author, version, about = "Node-local firewall state reconciliation agent")]
#[clap(propagate_version = true)]
struct CirrusCli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile agent
    Agent,

    /// Clamp the host input chain and rebuild all firewall state from
    /// the database
    Recover,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CirrusCli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if !nix::unistd::Uid::effective().is_root() {
        Logger::error("cirrus must run as root to manage firewall state");
        std::process::exit(1);
    }

    let config = AgentConfig::from_env();

    match cli.command {
        Commands::Agent => {
            let agent = Agent::new(config).await?;
            agent.run().await?;
        }
        Commands::Recover => {
            let agent = Agent::new(config).await?;
            let report = agent.recover().await?;
            if report.any_failed() {
                Logger::error(&format!(
                    "recovery left failed namespaces: {:?}",
                    report.failed_namespaces
                ));
                std::process::exit(1);
            }
            Logger::success("firewall state rebuilt");
        }
    }

    Ok(())
}
