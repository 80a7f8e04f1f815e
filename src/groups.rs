//! Phenotype groups (e.g. transcripts of one gene) sharing one permutation null.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::error::{QtlError, Result};

/// A named, contiguous run of phenotype rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhenotypeGroup {
    pub id: String,
    pub rows: Range<usize>,
}

#[derive(Clone, Debug)]
pub struct PhenotypeGroups {
    groups: Vec<PhenotypeGroup>,
}

impl PhenotypeGroups {
    /// Builds groups from a phenotype -> group mapping. Every phenotype must be
    /// mapped and each group's members must be adjacent in phenotype order.
    pub fn from_mapping(phenotype_ids: &[String], mapping: &HashMap<String, String>) -> Result<Self> {
        let mut groups: Vec<PhenotypeGroup> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for (row, pid) in phenotype_ids.iter().enumerate() {
            let gid = mapping.get(pid).ok_or_else(|| {
                QtlError::input_validation(format!("phenotype '{}' has no group assignment", pid))
            })?;
            if let Some(last) = groups.last_mut().filter(|last| &last.id == gid) {
                last.rows.end = row + 1;
                continue;
            }
            if !seen.insert(gid.as_str()) {
                return Err(QtlError::input_validation(format!(
                    "group '{}' is not contiguous in phenotype order (phenotype '{}'); sort phenotypes by group",
                    gid, pid
                )));
            }
            groups.push(PhenotypeGroup {
                id: gid.clone(),
                rows: row..row + 1,
            });
        }
        Ok(Self { groups })
    }

    /// Each phenotype forms its own group.
    pub fn singletons(phenotype_ids: &[String]) -> Self {
        let groups = phenotype_ids
            .iter()
            .enumerate()
            .map(|(row, pid)| PhenotypeGroup {
                id: pid.clone(),
                rows: row..row + 1,
            })
            .collect();
        Self { groups }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhenotypeGroup> {
        self.groups.iter()
    }

    pub fn as_slice(&self) -> &[PhenotypeGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
