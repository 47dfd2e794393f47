//! Structural comparison of a deployed template against a new one.

use std::collections::BTreeSet;
use std::fmt;

use hoist_core::template::section;
use hoist_core::{Node, Pointer, StackTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
    Unchanged,
}

impl ChangeKind {
    fn marker(self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Removed => '-',
            ChangeKind::Changed => '~',
            ChangeKind::Unchanged => ' ',
        }
    }
}

/// One logical ID (or top-level field) compared across both templates.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    /// Keyed section the entry belongs to; `None` for top-level fields.
    pub section: Option<String>,
    pub id: String,
    pub kind: ChangeKind,
    pub old: Option<Node>,
    pub new: Option<Node>,
    /// Differing leaves, as absolute pointers. Empty unless `Changed`.
    pub paths: Vec<Pointer>,
}

impl DiffEntry {
    fn location(&self) -> String {
        match &self.section {
            Some(section) => format!("{section}.{}", self.id),
            None => self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredDiff {
    pub entries: Vec<DiffEntry>,
}

impl StructuredDiff {
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.kind != ChangeKind::Unchanged)
    }

    /// Exit code for `hoist diff`: 0 when identical, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.has_changes() { 1 } else { 0 }
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| e.kind != ChangeKind::Unchanged)
    }
}

impl fmt::Display for StructuredDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.changes() {
            writeln!(f, "{} {}", entry.kind.marker(), entry.location())?;
            for path in &entry.paths {
                writeln!(f, "    {path}")?;
            }
        }
        write!(
            f,
            "{} to add, {} to change, {} to remove",
            self.count(ChangeKind::Added),
            self.count(ChangeKind::Changed),
            self.count(ChangeKind::Removed),
        )
    }
}

/// Compare `old` (the deployed template, empty when absent) to `new`.
///
/// Keyed sections produce one entry per logical ID; every other top-level
/// key produces a single entry. Ordering follows section order, then ID.
pub fn diff_templates(old: &StackTemplate, new: &StackTemplate) -> StructuredDiff {
    let mut entries = Vec::new();

    let top_level: BTreeSet<&str> = old
        .root()
        .keys()
        .chain(new.root().keys())
        .map(String::as_str)
        .filter(|key| !section::KEYED.contains(key))
        .collect();
    for key in top_level {
        entries.push(compare(
            None,
            key,
            old.get(key),
            new.get(key),
            Pointer::from_segments([key]),
        ));
    }

    for &name in section::KEYED {
        let before = old.section(name);
        let after = new.section(name);
        let ids: BTreeSet<&String> = before
            .into_iter()
            .flat_map(|m| m.keys())
            .chain(after.into_iter().flat_map(|m| m.keys()))
            .collect();
        for id in ids {
            entries.push(compare(
                Some(name),
                id,
                before.and_then(|m| m.get(id)),
                after.and_then(|m| m.get(id)),
                Pointer::from_segments([name, id.as_str()]),
            ));
        }
    }

    StructuredDiff { entries }
}

fn compare(
    section: Option<&str>,
    id: &str,
    old: Option<&Node>,
    new: Option<&Node>,
    at: Pointer,
) -> DiffEntry {
    let (kind, paths) = match (old, new) {
        (None, _) => (ChangeKind::Added, Vec::new()),
        (_, None) => (ChangeKind::Removed, Vec::new()),
        (Some(a), Some(b)) if a == b => (ChangeKind::Unchanged, Vec::new()),
        (Some(a), Some(b)) => {
            let mut paths = Vec::new();
            leaf_differences(a, b, &at, &mut paths);
            (ChangeKind::Changed, paths)
        }
    };
    DiffEntry {
        section: section.map(str::to_owned),
        id: id.to_owned(),
        kind,
        old: old.cloned(),
        new: new.cloned(),
        paths,
    }
}

fn leaf_differences(old: &Node, new: &Node, at: &Pointer, out: &mut Vec<Pointer>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Node::Map(a), Node::Map(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => leaf_differences(x, y, &at.child(key.as_str()), out),
                    _ => out.push(at.child(key.as_str())),
                }
            }
        }
        // Lists that changed length are reported as a whole.
        (Node::List(a), Node::List(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                leaf_differences(x, y, &at.child(i.to_string()), out);
            }
        }
        _ => out.push(at.clone()),
    }
}
