//! Plan command - print what a bootstrap would do, without touching anything

use clap::Args;
use keystone::catalog;

use crate::config::ClusterArgs;
use crate::Result;

/// Print the topology and the ordered phase list
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

pub fn run(args: PlanArgs) -> Result<u8> {
    let config = args.cluster.to_config()?;
    let phases = catalog::control_plane(&config.topology, &config.catalog)?;
    print!("{}", super::render_plan(&config.topology, &phases));
    Ok(0)
}
