//! Grouping of fetched records by a secondary key
//!
//! Grouping is pure and borrows the fetched records; nothing is cloned until
//! the writer projects rows.

use indexmap::IndexMap;

use crate::types::{GroupCount, Record, render_value};

/// Records sharing one group key, in input order
#[derive(Clone, Debug, PartialEq)]
pub struct Group<'a> {
    group_key: String,
    records: Vec<&'a Record>,
}

impl<'a> Group<'a> {
    /// The group key value
    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Member records, in the order they were supplied
    pub fn records(&self) -> &[&'a Record] {
        &self.records
    }

    /// Number of member records
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

/// Insertion-ordered mapping of group key to group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Groups<'a> {
    groups: IndexMap<String, Group<'a>>,
    skipped: usize,
}

impl<'a> Groups<'a> {
    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no record was grouped
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Records skipped because the group field was absent, null or empty
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Look up one group
    pub fn get(&self, group_key: &str) -> Option<&Group<'a>> {
        self.groups.get(group_key)
    }

    /// Groups in first-occurrence order
    pub fn iter(&self) -> impl Iterator<Item = &Group<'a>> {
        self.groups.values()
    }

    /// Member records of every group, group by group
    pub fn records(&self) -> impl Iterator<Item = &'a Record> + '_ {
        self.groups.values().flat_map(|g| g.records.iter().copied())
    }

    /// Per-group counts, in group order
    pub fn counts(&self) -> Vec<GroupCount> {
        self.groups
            .values()
            .map(|g| GroupCount {
                group_key: g.group_key.clone(),
                count: g.count(),
            })
            .collect()
    }

    /// `[group_key, count]` rows for the group summary file
    pub fn summary_rows(&self) -> Vec<[String; 2]> {
        self.groups
            .values()
            .map(|g| [g.group_key.clone(), g.count().to_string()])
            .collect()
    }
}

impl<'g, 'a> IntoIterator for &'g Groups<'a> {
    type Item = &'g Group<'a>;
    type IntoIter = indexmap::map::Values<'g, String, Group<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.values()
    }
}

/// Group key of a record, `None` when the field is absent, null or empty
pub fn group_key_of(record: &Record, field: &str) -> Option<String> {
    record
        .get(field)
        .and_then(render_value)
        .filter(|key| !key.is_empty())
}

/// Group `records` by the rendered value of `field`
///
/// Groups appear in the order their key is first seen; records keep their
/// relative order within a group.
pub fn group_records<'a>(records: &'a [Record], field: &str) -> Groups<'a> {
    let mut groups: IndexMap<String, Group<'a>> = IndexMap::new();
    let mut skipped = 0;

    for record in records {
        let Some(group_key) = group_key_of(record, field) else {
            skipped += 1;
            continue;
        };
        groups
            .entry(group_key)
            .or_insert_with_key(|key| Group {
                group_key: key.clone(),
                records: Vec::new(),
            })
            .records
            .push(record);
    }

    if skipped > 0 {
        tracing::debug!(field, skipped, "Records without a group key were skipped");
    }

    Groups { groups, skipped }
}
