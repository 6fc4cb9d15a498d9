//! Service request ledger.
//!
//! Owns the canonical lifecycle state of a field request: intake with
//! per-incident sequence numbers, patch updates with the cancellation
//! cascade, the derived aggregate status, and the bulk reunite path.
//!
//! Raw animal-status writes are "pending" until the recompute step runs;
//! every mutating path here finishes by deriving the aggregate status from
//! the animals, so the two never diverge.

use crate::audit::{AuditEvent, AuditLogger, Target};
use crate::error::{EngineError, EngineResult};
use crate::model::{NewServiceRequest, ServiceRequest, ServiceRequestPatch};
use crate::notify::Notifier;
use crate::status::{AnimalStatus, SrStatus};
use crate::store::{q, RamsStore};
use rusqlite::{params, Connection};
use tracing::info;

pub struct ServiceRequestLedger {
    store: RamsStore,
    audit: AuditLogger,
    notify: Notifier,
}

impl ServiceRequestLedger {
    pub fn new(store: RamsStore, audit: AuditLogger, notify: Notifier) -> Self {
        Self {
            store,
            audit,
            notify,
        }
    }

    /// Intake a new service request. The per-incident sequence number is
    /// assigned inside the inserting transaction.
    pub fn create(&self, actor: &str, new: NewServiceRequest) -> EngineResult<ServiceRequest> {
        let sr = self.store.with_tx_retry(|tx| {
            let incident = q::incident_by_slug(tx, &new.incident_slug)?.ok_or_else(|| {
                EngineError::validation(format!("unknown incident '{}'", new.incident_slug))
            })?;

            let seq = q::next_seq(tx, "service_requests", incident.id)?;
            tx.execute(
                r#"
                INSERT INTO service_requests
                    (incident_id, id_for_incident, address, city, state, latitude, longitude,
                     status, priority, followup_date, injured, accessible, turn_around, reporter_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'reported', ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    incident.id,
                    seq,
                    new.address,
                    new.city,
                    new.state,
                    new.latitude,
                    new.longitude,
                    new.priority,
                    new.followup_date,
                    new.injured,
                    new.accessible,
                    new.turn_around,
                    new.reporter_id
                ],
            )?;
            let id = tx.last_insert_rowid();

            for owner_id in &new.owner_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO sr_owners (service_request_id, person_id) VALUES (?, ?)",
                    params![id, owner_id],
                )?;
            }

            q::sr_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("service request", id))
        })?;

        info!("Created SR#{} for incident {}", sr.id_for_incident, sr.incident_id);
        self.audit.record_or_warn(AuditEvent::new(
            actor,
            "created service request",
            Target::service_request(sr.id),
        ));
        self.notify.on_new_data("map");
        Ok(sr)
    }

    /// Apply a patch. A transition into `canceled` cascades to the linked
    /// animals and to the open dispatch rounds tracking them.
    pub fn update(
        &self,
        actor: &str,
        id: i64,
        patch: ServiceRequestPatch,
    ) -> EngineResult<ServiceRequest> {
        // Guard before any write.
        let new_status = patch.status.as_deref().map(SrStatus::parse).transpose()?;

        let (sr, events) = self.store.with_tx(|tx| {
            let current = q::sr_by_id(tx, id)?
                .ok_or_else(|| EngineError::not_found("service request", id))?;

            let mut events = Vec::new();

            if let Some(address) = &patch.address {
                tx.execute(
                    "UPDATE service_requests SET address = ? WHERE id = ?",
                    params![address, id],
                )?;
            }
            if let Some(city) = &patch.city {
                tx.execute(
                    "UPDATE service_requests SET city = ? WHERE id = ?",
                    params![city, id],
                )?;
            }
            if let Some(state) = &patch.state {
                tx.execute(
                    "UPDATE service_requests SET state = ? WHERE id = ?",
                    params![state, id],
                )?;
            }
            if let Some(latitude) = patch.latitude {
                tx.execute(
                    "UPDATE service_requests SET latitude = ? WHERE id = ?",
                    params![latitude, id],
                )?;
            }
            if let Some(longitude) = patch.longitude {
                tx.execute(
                    "UPDATE service_requests SET longitude = ? WHERE id = ?",
                    params![longitude, id],
                )?;
            }
            if let Some(priority) = patch.priority {
                tx.execute(
                    "UPDATE service_requests SET priority = ? WHERE id = ?",
                    params![priority, id],
                )?;
            }
            if let Some(followup) = patch.followup_date {
                tx.execute(
                    "UPDATE service_requests SET followup_date = ? WHERE id = ?",
                    params![followup, id],
                )?;
            }
            if let Some(injured) = patch.injured {
                tx.execute(
                    "UPDATE service_requests SET injured = ? WHERE id = ?",
                    params![injured, id],
                )?;
            }
            if let Some(accessible) = patch.accessible {
                tx.execute(
                    "UPDATE service_requests SET accessible = ? WHERE id = ?",
                    params![accessible, id],
                )?;
            }
            if let Some(turn_around) = patch.turn_around {
                tx.execute(
                    "UPDATE service_requests SET turn_around = ? WHERE id = ?",
                    params![turn_around, id],
                )?;
            }

            match new_status {
                Some(SrStatus::Canceled) if current.status != SrStatus::Canceled => {
                    tx.execute(
                        "UPDATE service_requests SET status = 'canceled' WHERE id = ?",
                        params![id],
                    )?;
                    cancel_animals(tx, id)?;
                    events.push(AuditEvent::new(
                        actor,
                        "canceled service request",
                        Target::service_request(id),
                    ));
                }
                Some(status) => {
                    tx.execute(
                        "UPDATE service_requests SET status = ? WHERE id = ?",
                        params![status.as_str(), id],
                    )?;
                    events.push(AuditEvent::new(
                        actor,
                        "updated service request",
                        Target::service_request(id),
                    ));
                }
                None => {
                    events.push(AuditEvent::new(
                        actor,
                        "updated service request",
                        Target::service_request(id),
                    ));
                }
            }

            let sr = q::sr_by_id(tx, id)?
                .ok_or_else(|| EngineError::not_found("service request", id))?;
            Ok((sr, events))
        })?;

        for event in events {
            self.audit.record_or_warn(event);
        }
        Ok(sr)
    }

    /// Derive and commit the aggregate status from the current animal set.
    pub fn recompute_status(&self, id: i64) -> EngineResult<SrStatus> {
        self.store.with_tx(|tx| {
            q::sr_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("service request", id))?;
            recompute_in(tx, id)?;
            let sr = q::sr_by_id(tx, id)?
                .ok_or_else(|| EngineError::not_found("service request", id))?;
            Ok(sr.status)
        })
    }

    /// Bulk-reunite every animal that is not DECEASED or NO FURTHER ACTION,
    /// clearing shelter and room placement, then recompute the aggregate.
    pub fn reunite_all(&self, actor: &str, id: i64) -> EngineResult<ServiceRequest> {
        let (sr, events) = self.store.with_tx(|tx| {
            q::sr_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("service request", id))?;

            let mut events = Vec::new();
            for animal in q::animals_for_request(tx, id)? {
                if animal.status.is_final() || animal.status == AnimalStatus::Canceled {
                    continue;
                }
                tx.execute(
                    "UPDATE animals SET status = 'REUNITED', shelter_id = NULL, room_id = NULL
                     WHERE id = ?",
                    params![animal.id],
                )?;
                events.push(AuditEvent::new(
                    actor,
                    "changed animal status to REUNITED",
                    Target::animal(animal.id),
                ));
                rewrite_open_snapshots(tx, id, animal.id, AnimalStatus::Reunited)?;
            }

            recompute_in(tx, id)?;
            let sr = q::sr_by_id(tx, id)?
                .ok_or_else(|| EngineError::not_found("service request", id))?;
            Ok((sr, events))
        })?;

        for event in events {
            self.audit.record_or_warn(event);
        }
        Ok(sr)
    }
}

/// Aggregate status as a pure function of animal statuses. Canceled animals
/// do not count; with nothing left to consider, the stored status stands
/// (`None`).
pub fn derive_status(animals: &[AnimalStatus]) -> Option<SrStatus> {
    let considered: Vec<AnimalStatus> = animals
        .iter()
        .copied()
        .filter(|s| *s != AnimalStatus::Canceled)
        .collect();
    if considered.is_empty() {
        return None;
    }
    if considered.iter().any(|s| s.keeps_request_open()) {
        return Some(SrStatus::Open);
    }
    if considered.iter().all(|s| s.is_resolved()) {
        return Some(SrStatus::Closed);
    }
    Some(SrStatus::Assigned)
}

/// Commit the derived status. Called after every raw animal-status write.
pub(crate) fn recompute_in(conn: &Connection, sr_id: i64) -> EngineResult<()> {
    let statuses: Vec<AnimalStatus> = q::animals_for_request(conn, sr_id)?
        .iter()
        .map(|a| a.status)
        .collect();
    if let Some(status) = derive_status(&statuses) {
        conn.execute(
            "UPDATE service_requests SET status = ? WHERE id = ?",
            params![status.as_str(), sr_id],
        )?;
    }
    Ok(())
}

/// Cancellation cascade: animals that are not DECEASED or NO FURTHER ACTION
/// become CANCELED, and every open dispatch round's snapshot entry for them
/// is rewritten in place.
fn cancel_animals(conn: &Connection, sr_id: i64) -> EngineResult<()> {
    for animal in q::animals_for_request(conn, sr_id)? {
        if animal.status.is_final() || animal.status == AnimalStatus::Canceled {
            continue;
        }
        conn.execute(
            "UPDATE animals SET status = 'CANCELED' WHERE id = ?",
            params![animal.id],
        )?;
        rewrite_open_snapshots(conn, sr_id, animal.id, AnimalStatus::Canceled)?;
    }
    Ok(())
}

/// Rewrite one animal's snapshot status across every open assignment round
/// tracking the given service request.
fn rewrite_open_snapshots(
    conn: &Connection,
    sr_id: i64,
    animal_id: i64,
    status: AnimalStatus,
) -> EngineResult<()> {
    for mut ar in q::open_assigned_requests_for_sr(conn, sr_id)? {
        if let Some(snapshot) = ar.animals.get_mut(&animal_id) {
            snapshot.status = status;
            q::write_snapshot(conn, ar.id, &ar.animals)?;
        }
    }
    Ok(())
}
