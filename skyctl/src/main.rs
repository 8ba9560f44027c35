/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::error::Error;

use clap::{Parser, Subcommand};
use common::ctx::{Environment, ProviderConfig};

mod config;
mod logs;
mod node;
mod workloads;

#[derive(Parser)]
#[command(name = "skyctl")]
#[command(version = "0.1.0")]
#[command(about = "Skylet command line", long_about = None)]
struct Cli {
    /// The configuration file of the provider
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// Show the capacity and conditions reported for the node
    Node {
        /// The name of the node; defaults to the host name
        #[arg(short, long)]
        node_name: Option<String>,
    },
    /// List the workloads in the configured cluster or resource group
    Workloads,
    /// Print the logs of a container
    Logs {
        /// The ECS task ARN or ACI container group name
        #[arg(short, long)]
        workload: String,
        /// The name of the container
        #[arg(long)]
        container: String,
        /// Only print the last N lines
        #[arg(short, long)]
        tail: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    common::init_logger()?;

    let cli = Cli::parse();
    let env = Environment::capture();
    let config = ProviderConfig::from_file(cli.config, &env)?;

    match &cli.command {
        Commands::Config => config::run(&config)?,
        Commands::Node { node_name } => node::run(&config, node_name)?,
        Commands::Workloads => workloads::run(&config).await?,
        Commands::Logs {
            workload,
            container,
            tail,
        } => logs::run(&config, workload, container, *tail).await?,
    };

    Ok(())
}
