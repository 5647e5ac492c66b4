//! Topology command - print quorum and fault tolerance for a member list

use clap::Args;
use keystone::topology::{resolve_for, Environment};
use keystone::Topology;

use crate::Result;

/// Resolve a topology and print its quorum arithmetic
#[derive(Args, Debug)]
pub struct TopologyArgs {
    /// Deployment size class: single, limited-ha or full-ha
    #[arg(short, long, env = "KEYSTONE_ENVIRONMENT")]
    pub environment: String,

    /// Members as `hostname=address` or `address`, comma separated
    #[arg(short, long, env = "KEYSTONE_MEMBERS", value_delimiter = ',', required = true)]
    pub members: Vec<String>,
}

pub fn run(args: TopologyArgs) -> Result<u8> {
    let topology = keystone::resolve(&args.environment, &args.members)?;
    println!("{}", topology);
    if let Some(note) = even_member_note(&topology)? {
        println!();
        println!("{}", note);
    }
    Ok(0)
}

/// An even member count never tolerates more failures than one member fewer
fn even_member_note(topology: &Topology) -> Result<Option<String>> {
    let n = topology.size();
    if n % 2 != 0 {
        return Ok(None);
    }

    let smaller_env = if n - 1 == 1 {
        Environment::Single
    } else {
        Environment::FullHa
    };
    let fewer: Vec<String> = topology.members()[..n - 1]
        .iter()
        .map(|m| format!("{}={}", m.hostname, m.address))
        .collect();
    let smaller = resolve_for(smaller_env, &fewer)?;

    if topology.tolerates_more_than(&smaller) {
        return Ok(None);
    }
    Ok(Some(format!(
        "note: {} members tolerate {} failure(s), the same as {}; the extra member adds no fault tolerance",
        n,
        topology.fault_tolerance(),
        n - 1
    )))
}
