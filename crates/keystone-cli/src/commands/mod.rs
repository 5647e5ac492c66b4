//! CLI commands

use std::fmt::Write;

use keystone::phase::Phase;
use keystone::probe::Probe;
use keystone::Topology;

pub mod bootstrap;
pub mod plan;
pub mod topology;

/// Human-readable plan: the topology, then every phase with what it would do
pub fn render_plan(topology: &Topology, phases: &[Phase]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", topology);
    let _ = writeln!(out);
    let _ = writeln!(out, "phases:");

    for (i, phase) in phases.iter().enumerate() {
        let applies = if phase.applicability.applies_to(topology) {
            ""
        } else {
            " (not applicable)"
        };
        let _ = writeln!(
            out,
            "{:>2}. {} [{}]{}",
            i + 1,
            phase.name,
            phase.severity,
            applies
        );
        if !phase.description.is_empty() {
            let _ = writeln!(out, "    {}", phase.description);
        }
        if phase.precondition != Probe::Always {
            let _ = writeln!(out, "    requires:  {}", phase.precondition);
        }
        if phase.idempotency_check != Probe::Never {
            let _ = writeln!(out, "    skip when: {}", phase.idempotency_check);
        }
        if let (Some(partial), Some(repair)) = (&phase.partial_state, &phase.repair) {
            let _ = writeln!(out, "    repair:    {} when {}", repair, partial);
        }
        if let Some(action) = &phase.action {
            let retry = if phase.action_retryable {
                format!(" (up to {} attempts)", phase.retry_policy.attempts())
            } else {
                String::new()
            };
            let _ = writeln!(out, "    action:    {}{}", action, retry);
        }
        if phase.verification.probe != Probe::Always {
            let _ = writeln!(
                out,
                "    verify:    {} (within {:?})",
                phase.verification.probe,
                phase.verify_timeout()
            );
        }
    }
    out
}
