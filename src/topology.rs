//! Topology resolution
//!
//! Turns an environment selector plus the member list into an immutable
//! [`Topology`]: members, whether a floating endpoint is needed, quorum and
//! fault tolerance. Pure; no I/O.
//!
//! Quorum is `floor(n/2) + 1`, so an even member count never buys extra fault
//! tolerance: 2 members tolerate 0 failures like 1 member does, and 4 members
//! tolerate 1 failure like 3 members do.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::Error;

/// Deployment size class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    /// Exactly one member, no floating endpoint
    Single,
    /// Exactly two members behind a floating endpoint, no fault tolerance
    LimitedHa,
    /// Three or more members behind a floating endpoint
    FullHa,
}

impl Environment {
    /// Canonical selector name
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Single => "single",
            Environment::LimitedHa => "limited-ha",
            Environment::FullHa => "full-ha",
        }
    }

    /// Whether `count` members belong to this size class
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            Environment::Single => count == 1,
            Environment::LimitedHa => count == 2,
            Environment::FullHa => count >= 3,
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            Environment::Single => "exactly 1",
            Environment::LimitedHa => "exactly 2",
            Environment::FullHa => "at least 3",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    /// Accepts the canonical names and the deployment-stage aliases
    /// `dev`/`development`, `staging` and `production`/`prod`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" | "dev" | "development" => Ok(Environment::Single),
            "limited-ha" | "staging" => Ok(Environment::LimitedHa),
            "full-ha" | "production" | "prod" => Ok(Environment::FullHa),
            _ => Err(Error::configuration(
                "unknown environment, expected single, limited-ha or full-ha",
                s,
            )),
        }
    }
}

/// One cluster member
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Node hostname
    pub hostname: String,
    /// Address other members reach this node on
    pub address: String,
    /// Whether the node currently holds the floating endpoint
    pub is_endpoint_holder: bool,
}

impl Node {
    /// Parse `hostname=address` or a bare `address`
    fn parse(entry: &str) -> Result<Self, Error> {
        let trimmed = entry.trim();
        let (hostname, address) = match trimmed.split_once('=') {
            Some((h, a)) => (h.trim(), a.trim()),
            None => (trimmed, trimmed),
        };

        if hostname.is_empty() || address.is_empty() {
            return Err(Error::configuration(
                "member must be 'hostname=address' or 'address'",
                entry,
            ));
        }
        if hostname.contains(char::is_whitespace) || address.contains(char::is_whitespace) {
            return Err(Error::configuration("member must not contain whitespace", entry));
        }

        Ok(Self {
            hostname: hostname.to_string(),
            address: address.to_string(),
            is_endpoint_holder: false,
        })
    }
}

/// Minimum members that must be available for the cluster to operate
pub fn quorum_for(members: usize) -> usize {
    members / 2 + 1
}

/// Members that may fail while keeping quorum
pub fn fault_tolerance_for(members: usize) -> usize {
    members.saturating_sub(quorum_for(members))
}

/// Participating nodes plus derived quorum and endpoint properties
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Topology {
    environment: Environment,
    members: Vec<Node>,
    has_floating_endpoint: bool,
    quorum: usize,
    fault_tolerance: usize,
}

impl Topology {
    /// Size class this topology was resolved for
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Members in declared order; the first one bootstraps the cluster
    pub fn members(&self) -> &[Node] {
        &self.members
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// True only when there is more than one member
    pub fn has_floating_endpoint(&self) -> bool {
        self.has_floating_endpoint
    }

    /// `floor(n/2) + 1`
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// `n - quorum`
    pub fn fault_tolerance(&self) -> usize {
        self.fault_tolerance
    }

    /// The member that runs cluster initialization
    pub fn first_member(&self) -> &Node {
        // resolve() rejects empty member lists
        &self.members[0]
    }

    /// The member bound to the floating endpoint, if there is one
    pub fn endpoint_holder(&self) -> Option<&Node> {
        self.members.iter().find(|m| m.is_endpoint_holder)
    }

    /// Whether this topology survives strictly more member failures than `other`
    pub fn tolerates_more_than(&self, other: &Topology) -> bool {
        self.fault_tolerance > other.fault_tolerance
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "environment:       {}", self.environment)?;
        writeln!(f, "members:           {}", self.members.len())?;
        for member in &self.members {
            let holder = if member.is_endpoint_holder {
                " (endpoint holder)"
            } else {
                ""
            };
            writeln!(f, "  - {} {}{}", member.hostname, member.address, holder)?;
        }
        writeln!(f, "floating endpoint: {}", self.has_floating_endpoint)?;
        writeln!(f, "quorum:            {}", self.quorum)?;
        write!(f, "fault tolerance:   {}", self.fault_tolerance)
    }
}

/// Resolve an environment name and member list into a [`Topology`].
///
/// Fails with a configuration error if the member list is empty, an entry is
/// malformed or duplicated, the environment is unknown, or the member count
/// does not match the environment's size class.
pub fn resolve<S: AsRef<str>>(environment: &str, members: &[S]) -> Result<Topology, Error> {
    let environment: Environment = environment.parse()?;
    resolve_for(environment, members)
}

/// Like [`resolve`], for an already-parsed environment
pub fn resolve_for<S: AsRef<str>>(
    environment: Environment,
    members: &[S],
) -> Result<Topology, Error> {
    let echoed = members
        .iter()
        .map(|m| m.as_ref())
        .collect::<Vec<_>>()
        .join(",");

    if members.is_empty() {
        return Err(Error::configuration("member list is empty", echoed));
    }

    let mut nodes = members
        .iter()
        .map(|m| Node::parse(m.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    if !environment.accepts(nodes.len()) {
        return Err(Error::configuration(
            format!(
                "environment {} requires {} members, got {}",
                environment,
                environment.expected(),
                nodes.len()
            ),
            echoed,
        ));
    }

    let mut hostnames = BTreeSet::new();
    let mut addresses = BTreeSet::new();
    for node in &nodes {
        if !hostnames.insert(node.hostname.as_str()) {
            return Err(Error::configuration(
                format!("duplicate member hostname {}", node.hostname),
                echoed,
            ));
        }
        if !addresses.insert(node.address.as_str()) {
            return Err(Error::configuration(
                format!("duplicate member address {}", node.address),
                echoed,
            ));
        }
    }

    let has_floating_endpoint = nodes.len() > 1;
    if has_floating_endpoint {
        nodes[0].is_endpoint_holder = true;
    }

    let quorum = quorum_for(nodes.len());
    let fault_tolerance = fault_tolerance_for(nodes.len());

    Ok(Topology {
        environment,
        members: nodes,
        has_floating_endpoint,
        quorum,
        fault_tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("cp-{}=10.0.0.{}", i, i)).collect()
    }

    #[test]
    fn quorum_arithmetic_for_small_clusters() {
        let expected = [(1, 1, 0), (2, 2, 0), (3, 2, 1), (4, 3, 1), (5, 3, 2), (7, 4, 3)];
        for (n, quorum, tolerance) in expected {
            assert_eq!(quorum_for(n), quorum, "quorum for {}", n);
            assert_eq!(fault_tolerance_for(n), tolerance, "tolerance for {}", n);
        }
    }

    #[test]
    fn quorum_law_holds_for_all_sizes() {
        for n in 1..=64 {
            assert_eq!(quorum_for(n), n / 2 + 1);
            assert_eq!(fault_tolerance_for(n), n - quorum_for(n));
            assert!(quorum_for(n) > n / 2, "quorum must be a strict majority");
        }
    }

    #[test]
    fn floating_endpoint_only_with_multiple_members() {
        let single = resolve("single", &addrs(1)).unwrap();
        assert!(!single.has_floating_endpoint());
        assert!(single.endpoint_holder().is_none());

        let pair = resolve("limited-ha", &addrs(2)).unwrap();
        assert!(pair.has_floating_endpoint());
        assert_eq!(pair.endpoint_holder().unwrap().hostname, "cp-1");
        assert_eq!(pair.fault_tolerance(), 0);
    }

    #[test]
    fn four_members_tolerate_no_more_than_three() {
        let three = resolve("full-ha", &addrs(3)).unwrap();
        let four = resolve("full-ha", &addrs(4)).unwrap();
        assert_eq!(three.fault_tolerance(), 1);
        assert_eq!(four.fault_tolerance(), 1);
        assert_eq!(four.quorum(), 3);
        assert!(!four.tolerates_more_than(&three));

        let five = resolve("full-ha", &addrs(5)).unwrap();
        assert!(five.tolerates_more_than(&four));
    }

    #[test]
    fn empty_member_list_is_rejected() {
        let err = resolve::<String>("single", &[]).unwrap_err();
        assert!(err.to_string().contains("member list is empty"));
    }

    #[test]
    fn member_count_must_match_environment() {
        let err = resolve("single", &addrs(2)).unwrap_err();
        assert!(err.to_string().contains("exactly 1"));
        assert!(err.to_string().contains("cp-1=10.0.0.1,cp-2=10.0.0.2"));

        assert!(resolve("limited-ha", &addrs(3)).is_err());
        assert!(resolve("full-ha", &addrs(2)).is_err());
        assert!(resolve("full-ha", &addrs(9)).is_ok());
    }

    #[test]
    fn unknown_environment_echoes_input() {
        let err = resolve("edge", &addrs(1)).unwrap_err();
        assert!(err.to_string().contains("\"edge\""));
    }

    #[test]
    fn stage_aliases_map_to_size_classes() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Single);
        assert_eq!("staging".parse::<Environment>().unwrap(), Environment::LimitedHa);
        assert_eq!("Production".parse::<Environment>().unwrap(), Environment::FullHa);
    }

    #[test]
    fn bare_address_doubles_as_hostname() {
        let topo = resolve("single", &["192.168.1.10"]).unwrap();
        assert_eq!(topo.first_member().hostname, "192.168.1.10");
        assert_eq!(topo.first_member().address, "192.168.1.10");
    }

    #[test]
    fn duplicates_and_malformed_members_are_rejected() {
        let err = resolve("limited-ha", &["a=10.0.0.1", "a=10.0.0.2"]).unwrap_err();
        assert!(err.to_string().contains("duplicate member hostname a"));

        let err = resolve("limited-ha", &["a=10.0.0.1", "b=10.0.0.1"]).unwrap_err();
        assert!(err.to_string().contains("duplicate member address"));

        assert!(resolve("single", &["=10.0.0.1"]).is_err());
        assert!(resolve("single", &["cp 1=10.0.0.1"]).is_err());
    }

    #[test]
    fn display_lists_quorum_math() {
        let topo = resolve("full-ha", &addrs(4)).unwrap();
        let text = topo.to_string();
        assert!(text.contains("environment:       full-ha"));
        assert!(text.contains("cp-1 10.0.0.1 (endpoint holder)"));
        assert!(text.contains("quorum:            3"));
        assert!(text.contains("fault tolerance:   1"));
    }
}
