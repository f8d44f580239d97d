// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspect provisioning state recorded in a provisioner database

use anyhow::Context;
use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;
use provisioner::status;
use provisioner::Config;
use provisioner_db::views;
use provisioner_db::DataStore;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[clap(name = "provisioner-status", about = "Show cluster provisioning state")]
struct Args {
    /// provisioner configuration file naming the database to read
    #[clap(long, env = "PROVISIONER_CONFIG", action)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the provisioning steps of one cluster
    Progress {
        #[clap(action)]
        cluster_id: Uuid,
        /// include the events of steps that have not succeeded
        #[clap(long, action)]
        with_events: bool,
        #[clap(long, action)]
        json: bool,
    },
    /// List the clusters of one tenant
    Clusters {
        #[clap(action)]
        tenant_id: Uuid,
        #[clap(long, action)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    let log = config
        .log
        .to_logger("provisioner-status")
        .context("initializing logger")?;
    let datastore = DataStore::new(&log, &config.database)
        .await
        .with_context(|| format!("opening {}", config.database.path))?;

    match args.command {
        Command::Progress { cluster_id, with_events, json } => {
            let steps = datastore
                .cluster_provision_progress(cluster_id, with_events)
                .await
                .with_context(|| format!("reading progress of {cluster_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&steps)?);
            } else {
                print!("{}", status::render_progress(&steps));
                println!("overall: {}", status::overall_status(&steps));
            }
        }
        Command::Clusters { tenant_id, json } => {
            let clusters: Vec<views::ClusterSummary> = datastore
                .cluster_list_for_tenant(tenant_id)
                .await
                .with_context(|| format!("listing clusters of {tenant_id}"))?
                .into_iter()
                .map(views::ClusterSummary::from)
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else {
                print!("{}", status::render_clusters(&clusters));
            }
        }
    }

    Ok(())
}
