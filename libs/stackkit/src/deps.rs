//! Static service dependency sets.
//!
//! The sets order group start/stop; they never auto-provision anything. A
//! dependency that is not part of the requested group is simply ignored for
//! ordering purposes.

use crate::contracts::ServiceKind;

/// Kinds required to be running before the given kind starts.
#[must_use]
pub const fn dependencies(kind: ServiceKind) -> &'static [ServiceKind] {
    match kind {
        ServiceKind::Simulator
        | ServiceKind::ContentStore
        | ServiceKind::DocumentStore
        | ServiceKind::KeyValueStore => &[],
        ServiceKind::CoreApi => &[
            ServiceKind::Simulator,
            ServiceKind::ContentStore,
            ServiceKind::DocumentStore,
            ServiceKind::KeyValueStore,
        ],
        ServiceKind::Worker => &[ServiceKind::Simulator, ServiceKind::CoreApi],
        ServiceKind::MarketApi | ServiceKind::Market => &[ServiceKind::Simulator],
        ServiceKind::MarketWatcher => &[ServiceKind::Simulator, ServiceKind::MarketApi],
    }
}

/// Partition `kinds` into start waves: each wave only depends on kinds in
/// earlier waves (or on kinds outside the requested set).
#[must_use]
pub fn start_waves(kinds: &[ServiceKind]) -> Vec<Vec<ServiceKind>> {
    let mut remaining: Vec<ServiceKind> = {
        let mut seen = Vec::new();
        for &k in kinds {
            if !seen.contains(&k) {
                seen.push(k);
            }
        }
        seen
    };

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<ServiceKind>, Vec<ServiceKind>) =
            remaining.iter().copied().partition(|&k| {
                dependencies(k)
                    .iter()
                    .all(|dep| !remaining.contains(dep) || *dep == k)
            });

        // The static table is acyclic, so every round must make progress.
        if ready.is_empty() {
            waves.push(blocked);
            break;
        }
        waves.push(ready);
        remaining = blocked;
    }
    waves
}

/// Stop waves: reverse of the start order.
#[must_use]
pub fn stop_waves(kinds: &[ServiceKind]) -> Vec<Vec<ServiceKind>> {
    let mut waves = start_waves(kinds);
    waves.reverse();
    waves
}
