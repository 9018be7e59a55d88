//! Mesh planning: decide, for every pair of registered participants, whether
//! and how they should link.
//!
//! Rules, first match wins:
//!
//! 1. either side blacklists the other: skip
//! 2. either side has a whitelist that omits the other: skip
//! 3. an allowed-members set exists and contains neither side: skip
//! 4. same segment: `a` dials `b` on its local address
//! 5. `a` is public: `b` dials `a` on its public address
//! 6. `b` is public: `a` dials `b` on its public address
//! 7. otherwise the pair stays unconnected
//!
//! Two private participants in different segments have no route; there is no
//! relay or hole-punching fallback.

use std::collections::BTreeSet;

use huddle_core::{ConnectionDirective, HuddleError, ParticipantProfile};
use tracing::{debug, info, warn};

/// Outcome for one unordered pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairDecision {
    Dial(ConnectionDirective),
    Blacklisted,
    NotWhitelisted,
    /// Neither side is an allowed member.
    ClientsOnly,
    /// Private and in different segments.
    Unreachable,
}

/// Result of one planning cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// In pair order: lexicographic by the first name, then the second.
    pub directives: Vec<ConnectionDirective>,
    pub unreachable: Vec<(String, String)>,
    /// Pairs suppressed by blacklist, whitelist or membership.
    pub skipped: usize,
    /// Pairs whose evaluation failed, with the error message.
    pub failed: Vec<(String, String, String)>,
}

fn directive(
    initiator: &ParticipantProfile,
    target: &ParticipantProfile,
    address: &str,
) -> huddle_core::Result<ConnectionDirective> {
    if address.is_empty() {
        return Err(HuddleError::InvalidProfile {
            name: target.name.clone(),
            reason: "no address to dial".into(),
        });
    }
    if target.listen_port == 0 {
        return Err(HuddleError::InvalidProfile {
            name: target.name.clone(),
            reason: "listen port is 0".into(),
        });
    }
    Ok(ConnectionDirective {
        initiator: initiator.name.clone(),
        target_name: target.name.clone(),
        target_address: address.to_string(),
        target_port: target.listen_port,
        target_access_key: target.access_key.clone(),
    })
}

/// Apply the rules to a single pair.
pub fn decide(
    a: &ParticipantProfile,
    b: &ParticipantProfile,
    allowed_members: &BTreeSet<String>,
) -> huddle_core::Result<PairDecision> {
    if a.blacklist.contains(&b.name) || b.blacklist.contains(&a.name) {
        return Ok(PairDecision::Blacklisted);
    }
    if (!a.whitelist.is_empty() && !a.whitelist.contains(&b.name))
        || (!b.whitelist.is_empty() && !b.whitelist.contains(&a.name))
    {
        return Ok(PairDecision::NotWhitelisted);
    }
    if !allowed_members.is_empty()
        && !allowed_members.contains(&a.name)
        && !allowed_members.contains(&b.name)
    {
        return Ok(PairDecision::ClientsOnly);
    }

    if a.segment_id == b.segment_id {
        return directive(a, b, &b.local_address).map(PairDecision::Dial);
    }
    if a.is_public {
        return directive(b, a, &a.public_address).map(PairDecision::Dial);
    }
    if b.is_public {
        return directive(a, b, &b.public_address).map(PairDecision::Dial);
    }
    Ok(PairDecision::Unreachable)
}

/// Plan every unordered pair of `profiles`.
///
/// Profiles are sorted by name first, so the output does not depend on the
/// input order. A pair that fails to evaluate is logged and skipped.
pub fn plan(profiles: &[ParticipantProfile], allowed_members: &BTreeSet<String>) -> Plan {
    let mut sorted: Vec<&ParticipantProfile> = profiles.iter().collect();
    sorted.sort_by(|x, y| x.name.cmp(&y.name));

    let mut out = Plan::default();
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            match decide(a, b, allowed_members) {
                Ok(PairDecision::Dial(d)) => {
                    debug!(
                        initiator = %d.initiator,
                        target = %d.target_name,
                        address = %d.target_address,
                        port = d.target_port,
                        "planned link"
                    );
                    out.directives.push(d);
                }
                Ok(PairDecision::Unreachable) => {
                    info!(a = %a.name, b = %b.name, "no route between private participants in different segments");
                    out.unreachable.push((a.name.clone(), b.name.clone()));
                }
                Ok(skip) => {
                    debug!(a = %a.name, b = %b.name, decision = ?skip, "pair skipped");
                    out.skipped += 1;
                }
                Err(e) => {
                    warn!(a = %a.name, b = %b.name, error = %e, "pair evaluation failed");
                    out.failed.push((a.name.clone(), b.name.clone(), e.to_string()));
                }
            }
        }
    }
    out
}
