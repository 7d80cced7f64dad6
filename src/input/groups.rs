use std::collections::{BTreeSet, HashMap};
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::error::{CompareError, Result};

/// Which cells make up one side of a comparison.
///
/// A specification is resolved once against a [`CellLabeling`]; cells that match neither side of
/// a comparison are left out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSpec {
    /// Cells carrying exactly this label
    Label(String),
    /// Cells carrying any of these labels
    LabelUnion(BTreeSet<String>),
    /// Cells carrying none of these labels ("all others")
    Complement(BTreeSet<String>),
}

impl GroupSpec {
    pub fn label(label: impl Into<String>) -> Self {
        GroupSpec::Label(label.into())
    }

    pub fn union<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupSpec::LabelUnion(labels.into_iter().map(Into::into).collect())
    }

    pub fn complement<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupSpec::Complement(labels.into_iter().map(Into::into).collect())
    }

    /// Whether a cell with this label belongs to the group
    pub fn matches(&self, label: &str) -> bool {
        match self {
            GroupSpec::Label(l) => l == label,
            GroupSpec::LabelUnion(set) => set.contains(label),
            GroupSpec::Complement(set) => !set.contains(label),
        }
    }

    /// Labels the caller asked for by name. Each of them has to match at least one cell.
    fn requested_labels(&self) -> Vec<&str> {
        match self {
            GroupSpec::Label(l) => vec![l.as_str()],
            GroupSpec::LabelUnion(set) => set.iter().map(String::as_str).collect(),
            GroupSpec::Complement(_) => Vec::new(),
        }
    }
}

impl fmt::Display for GroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");
        match self {
            GroupSpec::Label(l) => write!(f, "{}", l),
            GroupSpec::LabelUnion(set) => write!(f, "{{{}}}", join(set)),
            GroupSpec::Complement(set) => write!(f, "not {{{}}}", join(set)),
        }
    }
}

/// Cell identifier to cluster/condition label.
#[derive(Debug, Clone, Default)]
pub struct CellLabeling {
    labels: HashMap<String, String>,
}

impl CellLabeling {
    pub fn new(labels: HashMap<String, String>) -> Self {
        CellLabeling { labels }
    }

    pub fn from_pairs<I, C, L>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, L)>,
        C: Into<String>,
        L: Into<String>,
    {
        CellLabeling {
            labels: pairs
                .into_iter()
                .map(|(c, l)| (c.into(), l.into()))
                .collect(),
        }
    }

    /// Build a labeling from a label vector parallel to `cell_ids`.
    pub fn from_aligned<S: AsRef<str>>(cell_ids: &[String], labels: &[S]) -> Result<Self> {
        if cell_ids.len() != labels.len() {
            return Err(CompareError::mismatch(format!(
                "{} cell identifiers but {} labels",
                cell_ids.len(),
                labels.len()
            )));
        }
        Ok(Self::from_pairs(
            cell_ids
                .iter()
                .zip(labels)
                .map(|(c, l)| (c.clone(), l.as_ref().to_string())),
        ))
    }

    pub fn label(&self, cell_id: &str) -> Option<&str> {
        self.labels.get(cell_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Distinct labels in sorted order
    pub fn distinct_labels(&self) -> BTreeSet<&str> {
        self.labels.values().map(String::as_str).collect()
    }
}

/// Resolve two group specifications over per-cell labels.
///
/// Returns one entry per cell: `None` when the cell is in neither group, `Some(false)` for
/// group 1 and `Some(true)` for group 2.
pub(crate) fn resolve_groups(
    cell_labels: &[&str],
    group1: &GroupSpec,
    group2: &GroupSpec,
) -> Result<Vec<Option<bool>>> {
    let present: BTreeSet<&str> = cell_labels.iter().copied().collect();
    for (name, spec) in [("group1", group1), ("group2", group2)] {
        for label in spec.requested_labels() {
            if !present.contains(label) {
                return Err(CompareError::mismatch(format!(
                    "{} label '{}' matches no cells",
                    name, label
                )));
            }
        }
    }

    let mut membership = Vec::with_capacity(cell_labels.len());
    for (i, &label) in cell_labels.iter().enumerate() {
        let in1 = group1.matches(label);
        let in2 = group2.matches(label);
        if in1 && in2 {
            return Err(CompareError::mismatch(format!(
                "cell at column {} (label '{}') belongs to both {} and {}",
                i, label, group1, group2
            )));
        }
        membership.push(match (in1, in2) {
            (true, false) => Some(false),
            (false, true) => Some(true),
            _ => None,
        });
    }

    for (name, spec, flag) in [("group1", group1, false), ("group2", group2, true)] {
        if !membership.iter().any(|m| *m == Some(flag)) {
            return Err(CompareError::mismatch(format!(
                "{} ({}) matches no cells",
                name, spec
            )));
        }
    }

    Ok(membership)
}

/// Keep at most `max_cells` of `members`, chosen uniformly with `rng`. Order is preserved.
pub(crate) fn subsample_members(members: Vec<usize>, max_cells: usize, rng: &mut StdRng) -> Vec<usize> {
    if members.len() <= max_cells {
        return members;
    }
    let mut picked = sample(rng, members.len(), max_cells).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| members[i]).collect()
}
