//! Group selections applied to a loaded vector.
//!
//! A group is either an explicit list of cell indices or the complement of a
//! sorted exclude list. Complements are evaluated with a merge pointer over
//! the exclude list, so the inclusion list is never materialized.

use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Value produced for a source index past the end of the vector.
pub const MISSING: f32 = f32::NAN;

/// Selection of population members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSpec {
    /// Explicit membership, any order, duplicates allowed
    Cells(Vec<u32>),
    /// Every member except `excluded`, which must be strictly increasing
    RestOf {
        /// Excluded cell indices
        excluded: Vec<u32>,
    },
}

impl GroupSpec {
    /// Select every member of the population.
    pub fn all() -> Self {
        GroupSpec::RestOf {
            excluded: Vec::new(),
        }
    }

    /// Check the selection is well formed.
    ///
    /// Explicit indices may point past the population; they extract as
    /// [`MISSING`]. Excluded indices past the population exclude nothing.
    /// Exclude lists must be strictly increasing.
    pub fn validate(&self) -> Result<()> {
        match self {
            GroupSpec::Cells(_) => Ok(()),
            GroupSpec::RestOf { excluded } => {
                if let Some(pair) = excluded.windows(2).find(|w| w[0] >= w[1]) {
                    return Err(Error::InvalidRequest(format!(
                        "Excluded cell indices must be sorted and unique ({} then {})",
                        pair[0], pair[1]
                    )));
                }
                Ok(())
            }
        }
    }

    /// Number of values [`extract`](Self::extract) produces for a vector of
    /// `population_size` elements.
    pub fn member_count(&self, population_size: usize) -> usize {
        match self {
            GroupSpec::Cells(cells) => cells.len(),
            GroupSpec::RestOf { excluded } => {
                let in_range = excluded
                    .iter()
                    .filter(|&&i| (i as usize) < population_size)
                    .count();
                population_size.saturating_sub(in_range)
            }
        }
    }

    /// Pull this group's values out of a vector.
    pub fn extract(&self, values: &[f32]) -> Vec<f32> {
        match self {
            GroupSpec::Cells(cells) => cells
                .iter()
                .map(|&i| values.get(i as usize).copied().unwrap_or(MISSING))
                .collect(),
            GroupSpec::RestOf { excluded } => {
                let mut out = Vec::with_capacity(values.len().saturating_sub(excluded.len()));
                let mut skip = excluded.iter().map(|&i| i as usize).peekable();

                for (i, &value) in values.iter().enumerate() {
                    while skip.next_if(|&s| s < i).is_some() {}
                    if skip.next_if_eq(&i).is_some() {
                        continue;
                    }
                    out.push(value);
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<f32> {
        (0..6).map(|i| i as f32).collect()
    }

    #[test]
    fn test_cells_extract_any_order() {
        let group = GroupSpec::Cells(vec![4, 0, 4]);
        assert_eq!(group.extract(&values()), vec![4.0, 0.0, 4.0]);
        assert_eq!(group.member_count(6), 3);
    }

    #[test]
    fn test_cells_out_of_range_is_missing() {
        let group = GroupSpec::Cells(vec![1, 99]);
        let out = group.extract(&values());
        assert_eq!(out[0], 1.0);
        assert!(out[1].is_nan());
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_rest_of_extract() {
        let group = GroupSpec::RestOf {
            excluded: vec![0, 2, 5],
        };
        assert_eq!(group.extract(&values()), vec![1.0, 3.0, 4.0]);
        assert_eq!(group.member_count(6), 3);
    }

    #[test]
    fn test_rest_of_empty_is_all() {
        let group = GroupSpec::all();
        assert_eq!(group.extract(&values()), values());
        assert_eq!(group.member_count(6), 6);
    }

    #[test]
    fn test_rest_of_validation() {
        let unsorted = GroupSpec::RestOf {
            excluded: vec![3, 1],
        };
        assert!(matches!(unsorted.validate(), Err(Error::InvalidRequest(_))));

        let duplicate = GroupSpec::RestOf {
            excluded: vec![1, 1],
        };
        assert!(duplicate.validate().is_err());

        let past_end = GroupSpec::RestOf {
            excluded: vec![1, 60],
        };
        assert!(past_end.validate().is_ok());
        assert_eq!(past_end.member_count(6), 5);
        assert_eq!(past_end.extract(&values()).len(), 5);

        let ok = GroupSpec::RestOf {
            excluded: vec![1, 5],
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_member_count_matches_extract() {
        let group = GroupSpec::RestOf {
            excluded: vec![1, 3],
        };
        let out = group.extract(&values());
        assert_eq!(out.len(), group.member_count(values().len()));
    }

    #[test]
    fn test_serde_shape() {
        let group: GroupSpec = serde_json::from_str(r#"{"rest_of":{"excluded":[1,2]}}"#).unwrap();
        assert_eq!(
            group,
            GroupSpec::RestOf {
                excluded: vec![1, 2]
            }
        );
        let cells: GroupSpec = serde_json::from_str(r#"{"cells":[7]}"#).unwrap();
        assert_eq!(cells, GroupSpec::Cells(vec![7]));
    }
}
