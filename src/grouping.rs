// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, failed_precondition_error};

use skystack_elements::astro_util::CelestialLocation;

use crate::archive_client::ExposureRecord;

/// Exposure URLs sharing one exact location, in archive order.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureGroup {
    pub location: CelestialLocation,
    pub urls: Vec<String>,
}

impl ExposureGroup {
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Groups records by exact location equality. Groups are ordered by first
/// appearance of their location.
pub fn group_by_location(records: &[ExposureRecord]) -> Vec<ExposureGroup> {
    let mut groups: Vec<ExposureGroup> = Vec::new();
    for record in records {
        match groups.iter_mut().find(|g| g.location == record.location) {
            Some(group) => group.urls.push(record.url.clone()),
            None => groups.push(ExposureGroup{
                location: record.location,
                urls: vec![record.url.clone()],
            }),
        }
    }
    groups
}

/// The group with the strictly greatest number of exposures; on a tie, the
/// earliest one wins.
pub fn largest_group(groups: &[ExposureGroup]) -> Option<&ExposureGroup> {
    let mut best: Option<&ExposureGroup> = None;
    for group in groups {
        if best.map_or(true, |b| group.len() > b.len()) {
            best = Some(group);
        }
    }
    best
}

// Picks the group to stack. FailedPrecondition if even the largest group has
// fewer than `min_exposures` members.
pub fn select_group(groups: &[ExposureGroup], min_exposures: usize)
                    -> Result<&ExposureGroup, CanonicalError> {
    let group = largest_group(groups).ok_or_else(
        || failed_precondition_error("No exposure groups to select from"))?;
    if group.len() < min_exposures {
        return Err(failed_precondition_error(
            format!("Best group at {} has {} exposures, need {}",
                    group.location, group.len(), min_exposures).as_str()));
    }
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ra: f64, dec: f64, url: &str) -> ExposureRecord {
        ExposureRecord{
            location: CelestialLocation::new(ra, dec),
            url: url.to_string(),
            instrument: "WFC3".to_string(),
        }
    }

    // Interleaved rows for three locations with 3, 5 and 5 exposures.
    fn three_five_five() -> Vec<ExposureRecord> {
        let mut records = Vec::new();
        for n in 0..5 {
            if n < 3 {
                records.push(record(1.0, 1.0, &format!("a{}", n)));
            }
            records.push(record(2.0, 2.0, &format!("b{}", n)));
            records.push(record(3.0, 3.0, &format!("c{}", n)));
        }
        records
    }

    #[test]
    fn test_group_by_location() {
        let groups = group_by_location(&three_five_five());
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].location, CelestialLocation::new(1.0, 1.0));
        assert_eq!(groups[0].urls, vec!["a0", "a1", "a2"]);
        assert_eq!(groups[1].len(), 5);
        assert_eq!(groups[2].len(), 5);
        assert_eq!(groups[2].urls[4], "c4");
        for group in &groups {
            assert!(!group.is_empty());
        }
        assert!(group_by_location(&[]).is_empty());
    }

    #[test]
    fn test_grouping_is_exact() {
        let groups = group_by_location(&[record(10.0, 5.0, "x"),
                                         record(10.0000001, 5.0, "y")]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_select_first_of_tied_largest() {
        let groups = group_by_location(&three_five_five());
        let selected = select_group(&groups, 5).unwrap();
        assert_eq!(selected.location, CelestialLocation::new(2.0, 2.0));

        // Same sizes, different order.
        let reordered = vec![groups[2].clone(), groups[0].clone(), groups[1].clone()];
        let selected = select_group(&reordered, 5).unwrap();
        assert_eq!(selected.location, CelestialLocation::new(3.0, 3.0));
    }

    #[test]
    fn test_select_not_enough_exposures() {
        let groups = group_by_location(&three_five_five());
        let err = select_group(&groups, 6).unwrap_err();
        assert!(matches!(err.code, canonical_error::CanonicalErrorCode::FailedPrecondition));
        assert!(select_group(&[], 5).is_err());
        assert_eq!(largest_group(&[]), None);
    }

}  // mod tests.
