//! PID correlation for diagnostics.
//!
//! The correlator turns the grouped discovery output of every running
//! service into one display row per OS process. The "shared with" relation
//! is symmetric: rows are seeded asymmetrically (a backend records sharing
//! its store's pid) and closed reflexively in a second pass.

use std::collections::{BTreeMap, BTreeSet};

use colored::Colorize;

use crate::contracts::ServiceKind;
use crate::error::StackError;

/// One display row: a live process and the pids it shares state with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRow {
    pub pid: u32,
    pub kind: ServiceKind,
    pub label: String,
    pub shares: BTreeSet<u32>,
}

impl PidRow {
    #[must_use]
    pub fn new(pid: u32, kind: ServiceKind, label: impl Into<String>) -> Self {
        Self {
            pid,
            kind,
            label: label.into(),
            shares: BTreeSet::new(),
        }
    }

    /// Seed an asymmetric share declaration.
    #[must_use]
    pub fn sharing(mut self, pid: u32) -> Self {
        self.shares.insert(pid);
        self
    }
}

/// Relationship table keyed by pid.
#[derive(Debug, Default)]
pub struct PidTable {
    rows: BTreeMap<u32, PidRow>,
}

impl PidTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, merging share sets of repeated observations.
    ///
    /// # Errors
    /// [`StackError::AmbiguousDiscovery`] when the same pid is claimed under
    /// two different service kinds.
    pub fn insert(&mut self, row: PidRow) -> Result<(), StackError> {
        match self.rows.get_mut(&row.pid) {
            None => {
                self.rows.insert(row.pid, row);
                Ok(())
            }
            Some(existing) if existing.kind == row.kind => {
                existing.shares.extend(row.shares);
                Ok(())
            }
            Some(existing) => Err(StackError::AmbiguousDiscovery(format!(
                "pid {} claimed as both {} and {}",
                row.pid, existing.kind, row.kind
            ))),
        }
    }

    /// Close the share relation reflexively: for every declared `A shares B`
    /// where `B` has a row, ensure `B shares A`.
    pub fn close_reflexive(&mut self) {
        let declared: Vec<(u32, Vec<u32>)> = self
            .rows
            .values()
            .map(|row| (row.pid, row.shares.iter().copied().collect()))
            .collect();

        for (pid, shares) in declared {
            for shared in shares {
                if let Some(other) = self.rows.get_mut(&shared) {
                    other.shares.insert(pid);
                }
            }
        }
    }

    /// Rows ordered by pid.
    pub fn rows(&self) -> impl Iterator<Item = &PidRow> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render the table for terminal display.
    #[must_use]
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return format!("{}\n", "no managed processes running".dimmed());
        }

        let mut out = format!(
            "{:<8} {:<16} {:<32} {}\n",
            "PID".bold(),
            "TYPE".bold(),
            "SERVICE".bold(),
            "SHARED WITH".bold()
        );
        for row in self.rows.values() {
            let shares = if row.shares.is_empty() {
                "-".to_owned()
            } else {
                row.shares
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            out.push_str(&format!(
                "{:<8} {:<16} {:<32} {}\n",
                row.pid.to_string().green(),
                row.kind.as_str().cyan(),
                row.label,
                shares
            ));
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reflexive_closure() {
        let mut table = PidTable::new();
        table
            .insert(PidRow::new(100, ServiceKind::DocumentStore, "doc"))
            .unwrap();
        table
            .insert(PidRow::new(200, ServiceKind::MarketApi, "api").sharing(100))
            .unwrap();

        table.close_reflexive();

        // Every (A, B) with A->B also has B->A.
        for row in table.rows() {
            for &shared in &row.shares {
                let other = table.rows().find(|r| r.pid == shared).unwrap();
                assert!(
                    other.shares.contains(&row.pid),
                    "pid {} shares {} but not vice versa",
                    row.pid,
                    shared
                );
            }
        }
    }

    #[test]
    fn repeated_observation_merges_share_sets() {
        let mut table = PidTable::new();
        table
            .insert(PidRow::new(7, ServiceKind::MarketWatcher, "w").sharing(1))
            .unwrap();
        table
            .insert(PidRow::new(7, ServiceKind::MarketWatcher, "w").sharing(2))
            .unwrap();

        assert_eq!(table.len(), 1);
        let row = table.rows().next().unwrap();
        assert_eq!(row.shares, BTreeSet::from([1, 2]));
    }

    #[test]
    fn conflicting_kind_for_one_pid_is_rejected() {
        let mut table = PidTable::new();
        table
            .insert(PidRow::new(7, ServiceKind::Simulator, "sim"))
            .unwrap();

        let err = table
            .insert(PidRow::new(7, ServiceKind::Worker, "w"))
            .unwrap_err();
        assert!(matches!(err, StackError::AmbiguousDiscovery(_)));
    }

    #[test]
    fn closure_ignores_unknown_pids() {
        let mut table = PidTable::new();
        table
            .insert(PidRow::new(5, ServiceKind::CoreApi, "api").sharing(999))
            .unwrap();

        table.close_reflexive();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn render_lists_every_row() {
        colored::control::set_override(false);

        let mut table = PidTable::new();
        table
            .insert(PidRow::new(11, ServiceKind::Simulator, "simulator@1337"))
            .unwrap();
        table
            .insert(PidRow::new(22, ServiceKind::MarketApi, "market-api").sharing(11))
            .unwrap();

        let rendered = table.render();
        assert!(rendered.contains("simulator@1337"));
        assert!(rendered.contains("market-api"));
        assert!(rendered.contains("11"));

        colored::control::unset_override();
    }
}
