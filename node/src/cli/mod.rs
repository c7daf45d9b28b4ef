use std::path::PathBuf;

use clap::Parser;

use crate::config::{Configuration, NodeConfig, DEFAULT_NAMESPACE};
use crate::core::NodeStarter;

#[derive(Parser)]
#[command(name = "weft-node", about = "Multi-party orchestration node")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
pub enum Subcommand {
    /// Write a default configuration file.
    Init(InitCmd),
    /// Run the node.
    Run(RunCmd),
}

#[derive(Parser)]
pub struct InitCmd {
    /// Where to write the configuration.
    #[arg(long, default_value = "weft.toml")]
    pub config: PathBuf,
    #[arg(long)]
    pub org: String,
    #[arg(long)]
    pub node_name: String,
    #[arg(long)]
    pub signing_key: String,
}

impl InitCmd {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = Configuration {
            node: NodeConfig {
                namespace: DEFAULT_NAMESPACE.to_string(),
                org: self.org,
                node_name: self.node_name,
                signing_key: self.signing_key,
            },
            storage: Default::default(),
            batch: Default::default(),
            aggregator: Default::default(),
            operations: Default::default(),
            http: Default::default(),
            websocket: Default::default(),
        };
        config.try_save(&self.config)?;
        println!("Wrote configuration to {}", self.config.display());
        Ok(())
    }
}

#[derive(Parser)]
pub struct RunCmd {
    /// Configuration file to run with.
    #[arg(long, default_value = "weft.toml")]
    pub config: PathBuf,
}

impl RunCmd {
    pub async fn execute(self) -> anyhow::Result<()> {
        let config = Configuration::try_load(&self.config)?;
        let node = NodeStarter::new(config).init_tasks().await?;

        let mut handle = node.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received");
                handle.shutdown.shutdown();
            }
        });

        node.run().await;
        Ok(())
    }
}
