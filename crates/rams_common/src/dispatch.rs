//! Dispatch assignment engine.
//!
//! Couples a time-boxed team dispatch to a set of service requests and
//! their per-visit outcomes. Every top-level call runs as one transaction:
//! a failed entry aborts and rolls back the whole batch, so callers see
//! all-or-nothing semantics.
//!
//! Assignment states: open/preplanned (no team), open/active, closed
//! (end_time set). Closing is sticky; this engine never clears end_time.

use crate::audit::{AuditEvent, AuditLogger, Target};
use crate::error::{EngineError, EngineResult};
use crate::ledger;
use crate::model::*;
use crate::notify::Notifier;
use crate::status::{AnimalStatus, SrStatus};
use crate::store::{q, RamsStore};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use tracing::info;

pub struct DispatchEngine {
    store: RamsStore,
    audit: AuditLogger,
    notify: Notifier,
}

impl DispatchEngine {
    pub fn new(store: RamsStore, audit: AuditLogger, notify: Notifier) -> Self {
        Self {
            store,
            audit,
            notify,
        }
    }

    /// Create an assignment over a set of service requests, optionally
    /// creating or attaching a team. Rejected outright when any request is
    /// already out with another team.
    pub fn create(&self, actor: &str, new: NewAssignment) -> EngineResult<EvacAssignment> {
        let (assignment, team_name, events) = self.store.with_tx_retry(|tx| {
            let incident = q::incident_by_slug(tx, &new.incident_slug)?.ok_or_else(|| {
                EngineError::validation(format!("unknown incident '{}'", new.incident_slug))
            })?;

            // Duplicate-assignment guard, evaluated inside the same
            // transaction as the writes it protects.
            let mut requests = Vec::new();
            let mut conflicting = Vec::new();
            for sr_id in &new.service_requests {
                let sr = q::sr_by_id(tx, *sr_id)?
                    .ok_or_else(|| EngineError::not_found("service request", *sr_id))?;
                if sr.status == SrStatus::Assigned {
                    conflicting.push(sr.id);
                }
                requests.push(sr);
            }
            if !conflicting.is_empty() {
                return Err(EngineError::validation_with_ids(
                    "service requests already assigned",
                    conflicting,
                ));
            }

            let (team_id, team_name) = match &new.team {
                Some(TeamSpec::Existing { team }) => {
                    let team = q::team_by_id(tx, *team)?
                        .ok_or_else(|| EngineError::not_found("team", *team))?;
                    (Some(team.id), Some(team.name))
                }
                Some(TeamSpec::New { name, member_ids }) => {
                    let id = insert_team(tx, incident.id, name, member_ids)?;
                    (Some(id), Some(name.clone()))
                }
                None => (None, None),
            };

            let seq = q::next_seq(tx, "evac_assignments", incident.id)?;
            tx.execute(
                "INSERT INTO evac_assignments (incident_id, id_for_incident, team_id, start_time)
                 VALUES (?, ?, ?, ?)",
                params![incident.id, seq, team_id, Utc::now()],
            )?;
            let assignment_id = tx.last_insert_rowid();

            let mut events = vec![AuditEvent::new(
                actor,
                "created evacuation assignment",
                Target::assignment(assignment_id),
            )];

            for sr in &requests {
                attach_request(tx, assignment_id, sr)?;
                events.push(AuditEvent::new(
                    actor,
                    "assigned service request",
                    Target::service_request(sr.id),
                ));
            }

            let assignment = q::assignment_by_id(tx, assignment_id)?
                .ok_or_else(|| EngineError::not_found("evacuation assignment", assignment_id))?;
            Ok((assignment, team_name, events))
        })?;

        info!(
            "Created DA#{} with {} request(s)",
            assignment.id_for_incident,
            new.service_requests.len()
        );
        for event in events {
            self.audit.record_or_warn(event);
        }
        self.notify
            .assignment_created(assignment.id_for_incident, team_name.as_deref());
        Ok(assignment)
    }

    /// Apply a batch update: optional attach/team directives plus per-request
    /// field-visit outcomes, then close the assignment when nothing in the
    /// batch is marked incomplete.
    pub fn update(
        &self,
        actor: &str,
        assignment_id: i64,
        batch: AssignmentUpdate,
    ) -> EngineResult<EvacAssignment> {
        let (assignment, events) = self.store.with_tx(|tx| {
            let assignment = q::assignment_by_id(tx, assignment_id)?
                .ok_or_else(|| EngineError::not_found("evacuation assignment", assignment_id))?;

            let mut events = Vec::new();

            if let Some(sr_id) = batch.new_service_request {
                self.attach_additional(tx, actor, &assignment, sr_id, &mut events)?;
            }

            if !batch.new_team_members.is_empty() {
                add_team_members(tx, &assignment, &batch.new_team_members)?;
            }
            // The add directive may have attached a team; removal works on
            // the fresh row.
            let assignment = q::assignment_by_id(tx, assignment_id)?
                .ok_or_else(|| EngineError::not_found("evacuation assignment", assignment_id))?;
            if let Some(member_id) = batch.remove_team_member {
                remove_team_member(tx, &assignment, member_id)?;
            }

            for entry in &batch.sr_updates {
                apply_sr_update(tx, actor, &assignment, entry, &mut events)?;
            }

            // Close only when this batch actually reported outcomes and
            // none of them asked for another visit. Sticky once set.
            let fully_resolved = !batch.sr_updates.is_empty()
                && batch.sr_updates.iter().all(|entry| !entry.incomplete);
            if assignment.end_time.is_none() && fully_resolved {
                tx.execute(
                    "UPDATE evac_assignments SET end_time = ?, closed = 1 WHERE id = ?",
                    params![Utc::now(), assignment_id],
                )?;
            }

            events.push(AuditEvent::new(
                actor,
                "updated evacuation assignment",
                Target::assignment(assignment_id),
            ));

            let assignment = q::assignment_by_id(tx, assignment_id)?
                .ok_or_else(|| EngineError::not_found("evacuation assignment", assignment_id))?;
            Ok((assignment, events))
        })?;

        for event in events {
            self.audit.record_or_warn(event);
        }
        self.notify.on_new_data("map");
        Ok(assignment)
    }

    /// Attach one more service request mid-flight. If it is currently out
    /// with a different open assignment, it is detached there first; that
    /// round's history is left alone.
    fn attach_additional(
        &self,
        tx: &Connection,
        actor: &str,
        assignment: &EvacAssignment,
        sr_id: i64,
        events: &mut Vec<AuditEvent>,
    ) -> EngineResult<()> {
        let sr = q::sr_by_id(tx, sr_id)?
            .ok_or_else(|| EngineError::not_found("service request", sr_id))?;

        if let Some(other) = q::active_open_assignment_for_sr(tx, sr_id)? {
            if other != assignment.id {
                tx.execute(
                    "UPDATE assigned_requests SET active = 0
                     WHERE assignment_id = ? AND service_request_id = ?",
                    params![other, sr_id],
                )?;
            }
        }

        match q::assigned_request(tx, assignment.id, sr_id)? {
            Some(existing) => {
                // Re-attach to a round this request has already been part
                // of; the snapshot history stays as-is.
                tx.execute(
                    "UPDATE assigned_requests SET active = 1 WHERE id = ?",
                    params![existing.id],
                )?;
                tx.execute(
                    "UPDATE service_requests SET status = 'assigned' WHERE id = ?",
                    params![sr_id],
                )?;
            }
            None => attach_request(tx, assignment.id, &sr)?,
        }

        events.push(AuditEvent::new(
            actor,
            "assigned service request",
            Target::service_request(sr_id),
        ));
        Ok(())
    }
}

/// Mark a request assigned and snapshot its unresolved animals into a new
/// working record for this round.
fn attach_request(
    conn: &Connection,
    assignment_id: i64,
    sr: &ServiceRequest,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE service_requests SET status = 'assigned' WHERE id = ?",
        params![sr.id],
    )?;

    let mut snapshot = BTreeMap::new();
    for animal in q::animals_for_request(conn, sr.id)? {
        if animal.status.is_unresolved() {
            snapshot.insert(
                animal.id,
                AnimalSnapshot {
                    status: animal.status,
                    shelter: String::new(),
                },
            );
        }
    }

    let json = serde_json::to_string(&snapshot)?;
    conn.execute(
        "INSERT INTO assigned_requests (assignment_id, service_request_id, animals, followup_date)
         VALUES (?, ?, ?, ?)",
        params![assignment_id, sr.id, json, sr.followup_date],
    )?;
    Ok(())
}

fn insert_team(
    conn: &Connection,
    incident_id: i64,
    name: &str,
    member_ids: &[i64],
) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO dispatch_teams (incident_id, name, dispatch_date, show) VALUES (?, ?, ?, 1)",
        params![incident_id, name, Utc::now()],
    )?;
    let team_id = conn.last_insert_rowid();
    for member_id in member_ids {
        q::team_member_by_id(conn, *member_id)?
            .ok_or_else(|| EngineError::not_found("team member", *member_id))?;
        conn.execute(
            "INSERT OR IGNORE INTO dispatch_team_members (team_id, member_id) VALUES (?, ?)",
            params![team_id, member_id],
        )?;
    }
    Ok(team_id)
}

fn add_team_members(
    conn: &Connection,
    assignment: &EvacAssignment,
    member_ids: &[i64],
) -> EngineResult<()> {
    let team_id = match assignment.team_id {
        Some(id) => id,
        None => {
            // Preplanned assignment gaining its first members.
            let name = format!("Team {}", assignment.id_for_incident);
            let team_id = insert_team(conn, assignment.incident_id, &name, &[])?;
            conn.execute(
                "UPDATE evac_assignments SET team_id = ? WHERE id = ?",
                params![team_id, assignment.id],
            )?;
            team_id
        }
    };

    for member_id in member_ids {
        q::team_member_by_id(conn, *member_id)?
            .ok_or_else(|| EngineError::not_found("team member", *member_id))?;
        conn.execute(
            "INSERT OR IGNORE INTO dispatch_team_members (team_id, member_id) VALUES (?, ?)",
            params![team_id, member_id],
        )?;
    }
    Ok(())
}

fn remove_team_member(
    conn: &Connection,
    assignment: &EvacAssignment,
    member_id: i64,
) -> EngineResult<()> {
    let Some(team_id) = assignment.team_id else {
        return Ok(());
    };
    conn.execute(
        "DELETE FROM dispatch_team_members WHERE team_id = ? AND member_id = ?",
        params![team_id, member_id],
    )?;
    if q::team_member_count(conn, team_id)? == 0 {
        stamp_orphaned_rounds(conn, team_id)?;
    }
    Ok(())
}

/// A team that just lost its last member leaves its open rounds without
/// anyone in the field; stamp them (once) for downstream reporting. Does
/// not touch any service request status.
pub(crate) fn stamp_orphaned_rounds(conn: &Connection, team_id: i64) -> EngineResult<usize> {
    let stamped = conn.execute(
        "UPDATE assigned_requests SET timestamp = ?
         WHERE timestamp IS NULL
           AND assignment_id IN (
               SELECT id FROM evac_assignments WHERE team_id = ? AND end_time IS NULL
           )",
        params![Utc::now(), team_id],
    )?;
    Ok(stamped)
}

/// Apply one per-request entry of a batch: animal outcomes, derived request
/// status, visit note and owner contact upserts, and the detach-on-failure
/// path.
fn apply_sr_update(
    conn: &Connection,
    actor: &str,
    assignment: &EvacAssignment,
    entry: &SrUpdate,
    events: &mut Vec<AuditEvent>,
) -> EngineResult<()> {
    let sr = q::sr_by_id(conn, entry.id)?
        .ok_or_else(|| EngineError::not_found("service request", entry.id))?;
    let mut ar = q::assigned_request(conn, assignment.id, sr.id)?.ok_or_else(|| {
        EngineError::validation_with_ids(
            "service request is not part of this assignment",
            vec![sr.id],
        )
    })?;

    for outcome in &entry.animals {
        apply_outcome(conn, actor, &sr, &mut ar, outcome, events)?;
    }
    q::write_snapshot(conn, ar.id, &ar.animals)?;

    // Flag-derived status, overridden by what the animals actually say:
    // an unable-to-complete visit reopens, an incomplete one stays
    // assigned, and otherwise the aggregate derivation decides (ties favor
    // open over closed whenever an outstanding animal exists).
    let sr_status = if entry.unable_to_complete {
        SrStatus::Open
    } else if entry.incomplete {
        SrStatus::Assigned
    } else {
        let statuses: Vec<AnimalStatus> = q::animals_for_request(conn, sr.id)?
            .iter()
            .map(|a| a.status)
            .collect();
        ledger::derive_status(&statuses).unwrap_or(SrStatus::Closed)
    };

    conn.execute(
        "UPDATE service_requests SET status = ?, followup_date = ? WHERE id = ?",
        params![sr_status.as_str(), entry.followup_date, sr.id],
    )?;
    conn.execute(
        "UPDATE assigned_requests SET followup_date = ? WHERE id = ?",
        params![entry.followup_date, ar.id],
    )?;

    let verb = match sr_status {
        SrStatus::Open => "opened service request",
        SrStatus::Assigned => "assigned service request",
        _ => "closed service request",
    };
    events.push(AuditEvent::new(actor, verb, Target::service_request(sr.id)));

    upsert_visit_note(conn, &ar, entry)?;
    upsert_owner_contact(conn, &sr, &ar, entry)?;

    if entry.unable_to_complete {
        conn.execute(
            "UPDATE assigned_requests SET active = 0 WHERE id = ?",
            params![ar.id],
        )?;
    }
    Ok(())
}

/// Pure data write for one animal outcome; status derivation happens
/// separately once all outcomes in the entry have landed.
fn apply_outcome(
    conn: &Connection,
    actor: &str,
    sr: &ServiceRequest,
    ar: &mut AssignedRequest,
    outcome: &AnimalOutcome,
    events: &mut Vec<AuditEvent>,
) -> EngineResult<()> {
    let new_status = AnimalStatus::parse(&outcome.status)?;
    let animal = q::animal_by_id(conn, outcome.id)?
        .ok_or_else(|| EngineError::not_found("animal", outcome.id))?;

    if animal.status != new_status {
        events.push(AuditEvent::new(
            actor,
            format!("changed animal status to {}", new_status),
            Target::animal(animal.id),
        ));
        conn.execute(
            "UPDATE animals SET status = ? WHERE id = ?",
            params![new_status.as_str(), animal.id],
        )?;
    }

    if outcome.shelter != animal.shelter_id {
        if let Some(shelter_id) = outcome.shelter {
            q::shelter_by_id(conn, shelter_id)?
                .ok_or_else(|| EngineError::not_found("shelter", shelter_id))?;
            events.push(
                AuditEvent::new(actor, "sheltered animal in", Target::animal(animal.id))
                    .with_action_object(Target::shelter(shelter_id)),
            );
            events.push(
                AuditEvent::new(actor, "sheltered animal", Target::shelter(shelter_id))
                    .with_action_object(Target::animal(animal.id)),
            );
        } else if let Some(old) = animal.shelter_id {
            events.push(
                AuditEvent::new(actor, "removed animal", Target::shelter(old))
                    .with_action_object(Target::animal(animal.id)),
            );
        }
        conn.execute(
            "UPDATE animals SET shelter_id = ? WHERE id = ?",
            params![outcome.shelter, animal.id],
        )?;
    }

    // intake_date is stamped exactly once, on the first transition into a
    // sheltered state.
    if animal.intake_date.is_none()
        && (new_status.is_sheltered_state() || outcome.shelter.is_some())
    {
        conn.execute(
            "UPDATE animals SET intake_date = ? WHERE id = ? AND intake_date IS NULL",
            params![Utc::now(), animal.id],
        )?;
    }

    // Found-location defaulting: an animal with no address on file takes
    // the request's location.
    if animal.address.is_empty() {
        conn.execute(
            "UPDATE animals SET address = ?, city = ?, state = ? WHERE id = ?",
            params![sr.address, sr.city, sr.state, animal.id],
        )?;
    }

    ar.animals.insert(
        animal.id,
        AnimalSnapshot {
            status: new_status,
            shelter: outcome
                .shelter
                .map(|id| id.to_string())
                .unwrap_or_default(),
        },
    );
    Ok(())
}

/// Exactly one visit note per round: created on the first completion,
/// updated in place on later ones.
fn upsert_visit_note(
    conn: &Connection,
    ar: &AssignedRequest,
    entry: &SrUpdate,
) -> EngineResult<()> {
    let Some(date_completed) = entry.date_completed else {
        return Ok(());
    };

    match ar.visit_note_id {
        Some(note_id) => {
            conn.execute(
                "UPDATE visit_notes SET date_completed = ?, notes = ?, forced_entry = ?
                 WHERE id = ?",
                params![date_completed, entry.notes, entry.forced_entry, note_id],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO visit_notes (date_completed, notes, forced_entry) VALUES (?, ?, ?)",
                params![date_completed, entry.notes, entry.forced_entry],
            )?;
            let note_id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE assigned_requests SET visit_note_id = ? WHERE id = ?",
                params![note_id, ar.id],
            )?;
        }
    }
    Ok(())
}

/// At most one owner contact per round, same create-or-update contract as
/// the visit note. The contacted owner is the entry's explicit owner when
/// given, else the request's first owner.
fn upsert_owner_contact(
    conn: &Connection,
    sr: &ServiceRequest,
    ar: &AssignedRequest,
    entry: &SrUpdate,
) -> EngineResult<()> {
    if entry.owner_contact_note.is_empty() && entry.owner_contact_time.is_none() {
        return Ok(());
    }
    let owner_id = match entry.owner_contact_id {
        Some(id) => Some(id),
        None => q::sr_owner_ids(conn, sr.id)?.first().copied(),
    };
    let Some(owner_id) = owner_id else {
        // Nothing to record against; a contact note without any owner on
        // file is dropped.
        return Ok(());
    };

    match ar.owner_contact_id {
        Some(contact_id) => {
            conn.execute(
                "UPDATE owner_contacts SET owner_id = ?, note = ?, contact_time = ? WHERE id = ?",
                params![
                    owner_id,
                    entry.owner_contact_note,
                    entry.owner_contact_time,
                    contact_id
                ],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO owner_contacts (owner_id, note, contact_time) VALUES (?, ?, ?)",
                params![owner_id, entry.owner_contact_note, entry.owner_contact_time],
            )?;
            let contact_id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE assigned_requests SET owner_contact_id = ? WHERE id = ?",
                params![contact_id, ar.id],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ServiceRequestLedger;
    use crate::model::{NewAnimal, NewServiceRequest, NewTeamMember};
    use tempfile::tempdir;

    struct Fixture {
        store: RamsStore,
        ledger: ServiceRequestLedger,
        dispatch: DispatchEngine,
        audit: AuditLogger,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = RamsStore::open_in_memory().unwrap();
        store.create_incident("inc", "Test Incident").unwrap();
        let audit = AuditLogger::new(dir.path());
        let notify = Notifier::new();
        Fixture {
            ledger: ServiceRequestLedger::new(store.clone(), audit.clone(), notify.clone()),
            dispatch: DispatchEngine::new(store.clone(), audit.clone(), notify),
            store,
            audit,
            _dir: dir,
        }
    }

    fn sr_payload() -> NewServiceRequest {
        NewServiceRequest {
            incident_slug: "inc".into(),
            address: "12 Ash Ln".into(),
            city: "Paradise".into(),
            state: "CA".into(),
            latitude: None,
            longitude: None,
            priority: 2,
            followup_date: None,
            injured: false,
            accessible: true,
            turn_around: false,
            reporter_id: None,
            owner_ids: vec![],
        }
    }

    fn make_sr(f: &Fixture) -> ServiceRequest {
        f.ledger.create("t", sr_payload()).unwrap()
    }

    fn add_animal(f: &Fixture, sr_id: i64, status: &str) -> i64 {
        f.store
            .create_animal(NewAnimal {
                incident_slug: "inc".into(),
                species: "dog".into(),
                status: Some(status.into()),
                request_id: Some(sr_id),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    fn make_member(f: &Fixture) -> i64 {
        f.store
            .create_team_member(NewTeamMember {
                incident_slug: "inc".into(),
                first_name: "Ada".into(),
                last_name: "Reyes".into(),
                phone: "555-867-5309".into(),
                agency_id: None,
            })
            .unwrap()
            .id
    }

    fn create_assignment(f: &Fixture, sr_ids: Vec<i64>) -> EvacAssignment {
        f.dispatch
            .create(
                "t",
                NewAssignment {
                    incident_slug: "inc".into(),
                    service_requests: sr_ids,
                    team: None,
                },
            )
            .unwrap()
    }

    fn completed_entry(sr_id: i64, animals: Vec<AnimalOutcome>) -> SrUpdate {
        SrUpdate {
            id: sr_id,
            animals,
            followup_date: None,
            date_completed: Some(Utc::now()),
            notes: "visited".into(),
            forced_entry: false,
            owner_contact_id: None,
            owner_contact_note: String::new(),
            owner_contact_time: None,
            incomplete: false,
            unable_to_complete: false,
        }
    }

    #[test]
    fn test_create_marks_assigned_and_snapshots() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let resolved = add_animal(&f, sr.id, "REUNITED");

        let assignment = create_assignment(&f, vec![sr.id]);
        assert!(assignment.is_open());
        assert_eq!(assignment.id_for_incident, 1);

        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Assigned
        );

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert_eq!(ar.animals.len(), 1);
        let snapshot = ar.animals.get(&a1).unwrap();
        assert_eq!(snapshot.status, AnimalStatus::Reported);
        assert_eq!(snapshot.shelter, "");
        // Resolved animals are not part of the round.
        assert!(!ar.animals.contains_key(&resolved));
    }

    #[test]
    fn test_duplicate_assignment_guard() {
        let f = fixture();
        let sr = make_sr(&f);
        add_animal(&f, sr.id, "REPORTED");
        create_assignment(&f, vec![sr.id]);

        let result = f.dispatch.create(
            "t",
            NewAssignment {
                incident_slug: "inc".into(),
                service_requests: vec![sr.id],
                team: None,
            },
        );
        match result {
            Err(EngineError::Validation { ids, .. }) => assert_eq!(ids, vec![sr.id]),
            other => panic!("expected validation error, got {:?}", other.map(|a| a.id)),
        }
        // Nothing new was written.
        assert_eq!(f.store.list_assignments(None).unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_survives_rejected_create() {
        let f = fixture();
        let sr1 = make_sr(&f);
        let sr2 = make_sr(&f);
        create_assignment(&f, vec![sr1.id]);

        // Rejected create must not consume a sequence number.
        let _ = f.dispatch.create(
            "t",
            NewAssignment {
                incident_slug: "inc".into(),
                service_requests: vec![sr1.id],
                team: None,
            },
        );

        let assignment = create_assignment(&f, vec![sr2.id]);
        assert_eq!(assignment.id_for_incident, 2);
    }

    #[test]
    fn test_full_completion_closes_request_and_assignment() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let shelter = f.store.create_shelter("Fairgrounds", "").unwrap();
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "SHELTERED".into(),
                shelter: Some(shelter.id),
            }],
        );
        let updated = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        let animal = f.store.animal(a1).unwrap();
        assert_eq!(animal.status, AnimalStatus::Sheltered);
        assert_eq!(animal.shelter_id, Some(shelter.id));
        assert!(animal.intake_date.is_some());
        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Closed
        );
        assert!(updated.end_time.is_some());
        assert!(updated.closed);
    }

    #[test]
    fn test_sip_outcome_keeps_request_open() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "SHELTERED IN PLACE".into(),
                shelter: None,
            }],
        );
        let updated = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Open
        );
        // SIP stamps intake, and the visit itself was complete so the
        // assignment still closes.
        assert!(f.store.animal(a1).unwrap().intake_date.is_some());
        assert!(updated.end_time.is_some());
    }

    #[test]
    fn test_incomplete_entry_keeps_assignment_open() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let mut entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REPORTED".into(),
                shelter: None,
            }],
        );
        entry.incomplete = true;
        let updated = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(updated.end_time.is_none());
        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Assigned
        );
    }

    #[test]
    fn test_unable_to_complete_reopens_and_detaches() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let mut entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REPORTED".into(),
                shelter: None,
            }],
        );
        entry.unable_to_complete = true;
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Open
        );
        // History row remains, but the live join is gone.
        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert!(!ar.active);
    }

    #[test]
    fn test_visit_note_upsert_is_idempotent() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let outcome = |status: &str| {
            vec![AnimalOutcome {
                id: a1,
                status: status.into(),
                shelter: None,
            }]
        };

        let mut first = completed_entry(sr.id, outcome("UNABLE TO LOCATE"));
        first.notes = "no answer at door".into();
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![first],
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        let note_id = ar.visit_note_id.unwrap();
        assert_eq!(
            f.store.visit_note(note_id).unwrap().notes,
            "no answer at door"
        );

        let mut second = completed_entry(sr.id, outcome("REUNITED"));
        second.notes = "owner returned".into();
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![second],
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        // Same note, updated in place.
        assert_eq!(ar.visit_note_id, Some(note_id));
        assert_eq!(f.store.visit_note(note_id).unwrap().notes, "owner returned");
    }

    #[test]
    fn test_snapshot_status_echoes_back_into_outcomes() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "SHELTERED IN PLACE");
        let assignment = create_assignment(&f, vec![sr.id]);

        // The served snapshot carries wire strings, and a client echoing
        // one back as an outcome must be accepted.
        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        let json = serde_json::to_string(&ar.animals).unwrap();
        assert!(json.contains("\"SHELTERED IN PLACE\""));

        let echoed: std::collections::BTreeMap<i64, AnimalSnapshot> =
            serde_json::from_str(&json).unwrap();
        let status = echoed.get(&a1).unwrap().status.as_str().to_string();
        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status,
                shelter: None,
            }],
        );
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_owner_contact_upsert_is_idempotent() {
        let f = fixture();
        let owner_a = f
            .store
            .create_person(crate::model::NewPerson {
                first_name: "May".into(),
                last_name: "Holt".into(),
                is_owner: true,
                ..Default::default()
            })
            .unwrap();
        let owner_b = f
            .store
            .create_person(crate::model::NewPerson {
                first_name: "Ira".into(),
                last_name: "Voss".into(),
                is_owner: true,
                ..Default::default()
            })
            .unwrap();
        let sr = f
            .ledger
            .create(
                "t",
                NewServiceRequest {
                    owner_ids: vec![owner_a.id, owner_b.id],
                    ..sr_payload()
                },
            )
            .unwrap();
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let outcome = |status: &str| {
            vec![AnimalOutcome {
                id: a1,
                status: status.into(),
                shelter: None,
            }]
        };

        // First round: no explicit owner, so the request's first owner is
        // the one contacted.
        let mut first = completed_entry(sr.id, outcome("UNABLE TO LOCATE"));
        first.owner_contact_note = "left voicemail".into();
        first.owner_contact_time = Some(Utc::now());
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![first],
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        let contact_id = ar.owner_contact_id.unwrap();
        let contact = f.store.owner_contact(contact_id).unwrap();
        assert_eq!(contact.owner_id, owner_a.id);
        assert_eq!(contact.note, "left voicemail");

        // Second round: explicit owner, same contact updated in place.
        let mut second = completed_entry(sr.id, outcome("REUNITED"));
        second.owner_contact_id = Some(owner_b.id);
        second.owner_contact_note = "reached at work".into();
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![second],
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert_eq!(ar.owner_contact_id, Some(contact_id));
        let contact = f.store.owner_contact(contact_id).unwrap();
        assert_eq!(contact.owner_id, owner_b.id);
        assert_eq!(contact.note, "reached at work");
    }

    #[test]
    fn test_owner_contact_dropped_without_owner() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let mut entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REUNITED".into(),
                shelter: None,
            }],
        );
        entry.owner_contact_note = "nobody to call".into();
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert!(ar.owner_contact_id.is_none());
    }

    #[test]
    fn test_add_and_remove_member_in_one_batch() {
        let f = fixture();
        let sr = make_sr(&f);
        add_animal(&f, sr.id, "REPORTED");
        let member = make_member(&f);
        let assignment = create_assignment(&f, vec![sr.id]);
        assert!(assignment.team_id.is_none());

        // The removal must see the team the same batch just created.
        let updated = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    new_team_members: vec![member],
                    remove_team_member: Some(member),
                    ..Default::default()
                },
            )
            .unwrap();

        let team = f.store.team(updated.team_id.unwrap()).unwrap();
        assert!(team.member_ids.is_empty());
        // Emptied while the assignment is open: rounds are stamped.
        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert!(ar.timestamp.is_some());
    }

    #[test]
    fn test_intake_date_set_exactly_once() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let sh1 = f.store.create_shelter("Fairgrounds", "").unwrap();
        let sh2 = f.store.create_shelter("High School", "").unwrap();
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "SHELTERED".into(),
                shelter: Some(sh1.id),
            }],
        );
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();
        let first_intake = f.store.animal(a1).unwrap().intake_date.unwrap();

        // Reopen and move to a different shelter in a later round.
        f.ledger
            .update(
                "t",
                sr.id,
                ServiceRequestPatch {
                    status: Some("open".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let assignment2 = create_assignment(&f, vec![sr.id]);
        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "SHELTERED".into(),
                shelter: Some(sh2.id),
            }],
        );
        f.dispatch
            .update(
                "t",
                assignment2.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        let animal = f.store.animal(a1).unwrap();
        assert_eq!(animal.shelter_id, Some(sh2.id));
        assert_eq!(animal.intake_date.unwrap(), first_intake);
    }

    #[test]
    fn test_found_location_backfilled_from_request() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "UNABLE TO LOCATE".into(),
                shelter: None,
            }],
        );
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        let animal = f.store.animal(a1).unwrap();
        assert_eq!(animal.address, "12 Ash Ln");
        assert_eq!(animal.city, "Paradise");
    }

    #[test]
    fn test_attach_steals_from_other_open_assignment() {
        let f = fixture();
        let sr1 = make_sr(&f);
        let sr2 = make_sr(&f);
        add_animal(&f, sr1.id, "REPORTED");
        add_animal(&f, sr2.id, "REPORTED");
        let first = create_assignment(&f, vec![sr1.id]);
        let second = create_assignment(&f, vec![sr2.id]);

        f.dispatch
            .update(
                "t",
                second.id,
                AssignmentUpdate {
                    new_service_request: Some(sr1.id),
                    ..Default::default()
                },
            )
            .unwrap();

        // Detached from the first assignment, history intact.
        let old = f.store.assigned_request(first.id, sr1.id).unwrap().unwrap();
        assert!(!old.active);
        let new = f
            .store
            .assigned_request(second.id, sr1.id)
            .unwrap()
            .unwrap();
        assert!(new.active);
        assert_eq!(
            f.store.service_request(sr1.id).unwrap().status,
            SrStatus::Assigned
        );
    }

    #[test]
    fn test_removing_last_member_stamps_rounds_once() {
        let f = fixture();
        let sr = make_sr(&f);
        add_animal(&f, sr.id, "REPORTED");
        let member = make_member(&f);
        let assignment = f
            .dispatch
            .create(
                "t",
                NewAssignment {
                    incident_slug: "inc".into(),
                    service_requests: vec![sr.id],
                    team: Some(TeamSpec::New {
                        name: "Alpha".into(),
                        member_ids: vec![member],
                    }),
                },
            )
            .unwrap();

        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    remove_team_member: Some(member),
                    ..Default::default()
                },
            )
            .unwrap();

        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        let stamp = ar.timestamp.unwrap();

        // A second (redundant) removal never re-stamps.
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    remove_team_member: Some(member),
                    ..Default::default()
                },
            )
            .unwrap();
        let ar = f
            .store
            .assigned_request(assignment.id, sr.id)
            .unwrap()
            .unwrap();
        assert_eq!(ar.timestamp.unwrap(), stamp);
        // Team loss does not touch the request status.
        assert_eq!(
            f.store.service_request(sr.id).unwrap().status,
            SrStatus::Assigned
        );
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let f = fixture();
        let sr1 = make_sr(&f);
        let sr2 = make_sr(&f);
        let a1 = add_animal(&f, sr1.id, "REPORTED");
        let a2 = add_animal(&f, sr2.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr1.id, sr2.id]);

        let good = completed_entry(
            sr1.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REUNITED".into(),
                shelter: None,
            }],
        );
        let bad = completed_entry(
            sr2.id,
            vec![AnimalOutcome {
                id: 9999,
                status: "REUNITED".into(),
                shelter: None,
            }],
        );
        let result = f.dispatch.update(
            "t",
            assignment.id,
            AssignmentUpdate {
                sr_updates: vec![good, bad],
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(EngineError::NotFound { .. })));

        // The good entry rolled back with the bad one.
        assert_eq!(f.store.animal(a1).unwrap().status, AnimalStatus::Reported);
        assert_eq!(f.store.animal(a2).unwrap().status, AnimalStatus::Reported);
        assert!(f.store.assignment(assignment.id).unwrap().end_time.is_none());
    }

    #[test]
    fn test_close_is_sticky() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REUNITED".into(),
                shelter: None,
            }],
        );
        let closed = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry.clone()],
                    ..Default::default()
                },
            )
            .unwrap();
        let end_time = closed.end_time.unwrap();

        let again = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(again.end_time.unwrap(), end_time);
    }

    #[test]
    fn test_team_change_alone_never_closes() {
        let f = fixture();
        let sr = make_sr(&f);
        add_animal(&f, sr.id, "REPORTED");
        let member = make_member(&f);
        let assignment = create_assignment(&f, vec![sr.id]);

        let updated = f
            .dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    new_team_members: vec![member],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.end_time.is_none());
        // Preplanned assignment gained an auto-created team.
        assert!(updated.team_id.is_some());
        let team = f.store.team(updated.team_id.unwrap()).unwrap();
        assert_eq!(team.member_ids, vec![member]);
    }

    #[test]
    fn test_trailing_audit_event_order() {
        let f = fixture();
        let sr = make_sr(&f);
        let a1 = add_animal(&f, sr.id, "REPORTED");
        let assignment = create_assignment(&f, vec![sr.id]);

        let entry = completed_entry(
            sr.id,
            vec![AnimalOutcome {
                id: a1,
                status: "REUNITED".into(),
                shelter: None,
            }],
        );
        f.dispatch
            .update(
                "t",
                assignment.id,
                AssignmentUpdate {
                    sr_updates: vec![entry],
                    ..Default::default()
                },
            )
            .unwrap();

        // Newest-first read: the batch's trailing event comes back first.
        let events = f.audit.recent(1);
        assert_eq!(events[0].verb, "updated evacuation assignment");
    }
}
