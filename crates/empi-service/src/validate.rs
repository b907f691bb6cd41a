//! Manual-match request validation.
//!
//! Pure checks over the submitted person updates and the match group's
//! current (person, record) assignment. Nothing here touches the database.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::ServiceError;
use crate::types::{MatchGroupRecord, PersonUpdate};

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidPersonUpdate(message.into())
}

/// Check a single update's uuid/version pairing.
pub fn validate_person_update(update: &PersonUpdate) -> Result<(), ServiceError> {
    if update.uuid.is_some() && update.version.is_none() {
        return Err(invalid(
            "A PersonUpdate for an existing Person should specify a version",
        ));
    }

    if update.uuid.is_none() && update.version.is_some() {
        return Err(invalid(
            "A PersonUpdate for a new Person should not specify a version",
        ));
    }

    if update.uuid.is_none() && update.new_person_record_ids.is_empty() {
        return Err(invalid(
            "A PersonUpdate for a new Person should have 1 or more new_record_ids",
        ));
    }

    Ok(())
}

/// Diagnostic name for an update: its person uuid, or `index N` for a new
/// person.
fn update_label(update: &PersonUpdate, index: usize) -> String {
    match update.uuid {
        Some(uuid) => uuid.to_string(),
        None => format!("index {}", index),
    }
}

/// Check uniqueness of person uuids and record ids across the update set.
pub fn validate_person_updates(updates: &[PersonUpdate]) -> Result<(), ServiceError> {
    let uuids: Vec<Uuid> = updates.iter().filter_map(|update| update.uuid).collect();
    let unique_uuids: HashSet<Uuid> = uuids.iter().copied().collect();

    if uuids.len() != unique_uuids.len() {
        return Err(invalid(
            "The same Person UUID cannot exist in more than one PersonUpdate",
        ));
    }

    let mut label_by_record_id: HashMap<i64, String> = HashMap::new();

    for (index, update) in updates.iter().enumerate() {
        for &record_id in &update.new_person_record_ids {
            let label = update_label(update, index);
            match label_by_record_id.get(&record_id) {
                None => {
                    label_by_record_id.insert(record_id, label);
                }
                Some(previous) if *previous != label => {
                    return Err(invalid(format!(
                        "A PersonRecord ID cannot exist in more than one PersonUpdate. \
                         PersonRecord {} exists in updates for Person {} and Person {}.",
                        record_id, previous, label
                    )));
                }
                Some(previous) => {
                    return Err(invalid(format!(
                        "A PersonRecord ID cannot exist twice in the same PersonUpdate. \
                         PersonRecord {} exists in update for Person {} twice.",
                        record_id, previous
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Check the updates against the group's current assignment.
///
/// Every referenced person and record must belong to the group, and records
/// are conserved: a record leaving a named person must land in exactly one
/// other update, and a record arriving must have been released.
pub fn validate_update_records(
    updates: &[PersonUpdate],
    match_group_records: &[MatchGroupRecord],
) -> Result<(), ServiceError> {
    let mut current_person_uuids: HashSet<Uuid> = HashSet::new();
    let mut current_record_ids: HashSet<i64> = HashSet::new();
    let mut current_record_ids_by_person_uuid: HashMap<Uuid, HashSet<i64>> = HashMap::new();

    for record in match_group_records {
        current_person_uuids.insert(record.person_uuid);
        current_record_ids.insert(record.person_record_id);
        current_record_ids_by_person_uuid
            .entry(record.person_uuid)
            .or_default()
            .insert(record.person_record_id);
    }

    let mut new_person_uuids: HashSet<Uuid> = HashSet::new();
    let mut new_record_ids: HashSet<i64> = HashSet::new();

    for update in updates {
        if let Some(uuid) = update.uuid {
            if !current_person_uuids.contains(&uuid) {
                return Err(invalid(
                    "Specified Person UUID must be related to PotentialMatch",
                ));
            }
            new_person_uuids.insert(uuid);
        }

        for &record_id in &update.new_person_record_ids {
            if !current_record_ids.contains(&record_id) {
                return Err(invalid(
                    "PersonRecord IDs specified in new_person_record_ids must be related \
                     to PotentialMatch",
                ));
            }
            new_record_ids.insert(record_id);
        }
    }

    for (person_uuid, record_ids) in &current_record_ids_by_person_uuid {
        for record_id in record_ids {
            if new_person_uuids.contains(person_uuid) && !new_record_ids.contains(record_id) {
                return Err(invalid(
                    "PersonRecord IDs that are removed from a Person, must be added to \
                     another Person",
                ));
            }
            if !new_person_uuids.contains(person_uuid) && new_record_ids.contains(record_id) {
                return Err(invalid(
                    "PersonRecord IDs that are added to a Person, must be removed from \
                     another Person",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn existing(person: u128, version: i64, records: &[i64]) -> PersonUpdate {
        PersonUpdate {
            uuid: Some(uuid(person)),
            version: Some(version),
            new_person_record_ids: records.to_vec(),
        }
    }

    fn fresh(records: &[i64]) -> PersonUpdate {
        PersonUpdate {
            uuid: None,
            version: None,
            new_person_record_ids: records.to_vec(),
        }
    }

    fn member(person: u128, person_id: i64, record_id: i64) -> MatchGroupRecord {
        MatchGroupRecord {
            person_id,
            person_uuid: uuid(person),
            person_record_id: record_id,
        }
    }

    fn message(err: ServiceError) -> String {
        err.to_string()
    }

    #[test]
    fn existing_update_requires_version() {
        let update = PersonUpdate {
            uuid: Some(uuid(1)),
            version: None,
            new_person_record_ids: vec![1],
        };
        let err = validate_person_update(&update).unwrap_err();
        assert!(message(err).contains("should specify a version"));
    }

    #[test]
    fn new_update_must_not_carry_version() {
        let update = PersonUpdate {
            uuid: None,
            version: Some(3),
            new_person_record_ids: vec![1],
        };
        let err = validate_person_update(&update).unwrap_err();
        assert!(message(err).contains("should not specify a version"));
    }

    #[test]
    fn new_update_needs_records() {
        let err = validate_person_update(&fresh(&[])).unwrap_err();
        assert!(message(err).contains("1 or more new_record_ids"));
    }

    #[test]
    fn valid_updates_pass() {
        assert!(validate_person_update(&existing(1, 2, &[1, 2])).is_ok());
        assert!(validate_person_update(&fresh(&[3])).is_ok());
        // An existing person may be left with no records (it gets deleted).
        assert!(validate_person_update(&existing(1, 2, &[])).is_ok());
    }

    #[test]
    fn duplicate_person_uuid_rejected() {
        let updates = vec![existing(1, 1, &[1]), existing(1, 1, &[2])];
        let err = validate_person_updates(&updates).unwrap_err();
        assert!(message(err).contains("same Person UUID"));
    }

    #[test]
    fn record_in_two_updates_names_both_updates() {
        let updates = vec![existing(1, 1, &[7]), fresh(&[7])];
        let err = validate_person_updates(&updates).unwrap_err();
        let msg = message(err);
        assert!(msg.contains("PersonRecord 7"));
        assert!(msg.contains(&uuid(1).to_string()));
        assert!(msg.contains("index 1"));
    }

    #[test]
    fn record_twice_in_same_update_rejected() {
        let updates = vec![fresh(&[5, 5])];
        let err = validate_person_updates(&updates).unwrap_err();
        assert!(message(err).contains("twice"));
    }

    #[test]
    fn unknown_person_uuid_rejected() {
        let records = vec![member(1, 10, 100), member(2, 20, 200)];
        let updates = vec![existing(9, 1, &[100])];
        let err = validate_update_records(&updates, &records).unwrap_err();
        assert!(message(err).contains("must be related to PotentialMatch"));
    }

    #[test]
    fn unknown_record_id_rejected() {
        let records = vec![member(1, 10, 100)];
        let updates = vec![existing(1, 1, &[100, 999])];
        let err = validate_update_records(&updates, &records).unwrap_err();
        assert!(message(err).contains("new_person_record_ids"));
    }

    #[test]
    fn removed_record_must_land_somewhere() {
        let records = vec![member(1, 10, 100), member(1, 10, 101), member(2, 20, 200)];
        // Record 101 leaves person 1 but is claimed by nobody.
        let updates = vec![existing(1, 1, &[100])];
        let err = validate_update_records(&updates, &records).unwrap_err();
        assert!(message(err).contains("must be added to another Person"));
    }

    #[test]
    fn taken_record_must_be_released() {
        let records = vec![member(1, 10, 100), member(2, 20, 200)];
        // Record 200 is claimed by person 1, but person 2 is not updated.
        let updates = vec![existing(1, 1, &[100, 200])];
        let err = validate_update_records(&updates, &records).unwrap_err();
        assert!(message(err).contains("must be removed from another Person"));
    }

    #[test]
    fn conserving_split_passes() {
        let records = vec![
            member(1, 10, 100),
            member(2, 20, 200),
            member(3, 30, 300),
            member(4, 40, 400),
        ];
        // Person 1 absorbs record 200, person 2 takes 300, person 3 empties
        // out, person 4 untouched.
        let updates = vec![
            existing(1, 1, &[100, 200]),
            existing(2, 1, &[300]),
            existing(3, 1, &[]),
        ];
        assert!(validate_update_records(&updates, &records).is_ok());
    }

    #[test]
    fn move_to_new_person_passes() {
        let records = vec![member(1, 10, 100), member(1, 10, 101)];
        let updates = vec![existing(1, 1, &[100]), fresh(&[101])];
        assert!(validate_update_records(&updates, &records).is_ok());
    }
}
