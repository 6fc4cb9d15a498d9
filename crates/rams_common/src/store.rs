//! SQLite-backed persistent store.
//!
//! One connection behind a mutex; every engine operation runs as one short
//! transaction. Per-incident sequence numbers are computed inside the
//! inserting transaction and backed by UNIQUE constraints, with a bounded
//! retry when two writers collide.

use crate::error::{EngineError, EngineResult};
use crate::model::*;
use crate::status::{AnimalStatus, SrStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Attempts at a transaction before a uniqueness race is surfaced.
const MAX_TX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct RamsStore {
    conn: Arc<Mutex<Connection>>,
}

impl RamsStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Conflict(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS persons (
                id INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                phone TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT '',
                is_owner INTEGER NOT NULL DEFAULT 0,
                is_reporter INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS shelters (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY,
                shelter_id INTEGER NOT NULL REFERENCES shelters(id),
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_requests (
                id INTEGER PRIMARY KEY,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                id_for_incident INTEGER NOT NULL,
                address TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT '',
                latitude REAL,
                longitude REAL,
                status TEXT NOT NULL DEFAULT 'reported',
                priority INTEGER NOT NULL DEFAULT 2,
                followup_date TEXT,
                injured INTEGER NOT NULL DEFAULT 0,
                accessible INTEGER NOT NULL DEFAULT 0,
                turn_around INTEGER NOT NULL DEFAULT 0,
                reporter_id INTEGER REFERENCES persons(id),
                UNIQUE(incident_id, id_for_incident)
            );

            CREATE TABLE IF NOT EXISTS sr_owners (
                service_request_id INTEGER NOT NULL REFERENCES service_requests(id),
                person_id INTEGER NOT NULL REFERENCES persons(id),
                UNIQUE(service_request_id, person_id)
            );

            CREATE TABLE IF NOT EXISTS animals (
                id INTEGER PRIMARY KEY,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                name TEXT NOT NULL DEFAULT '',
                species TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'REPORTED',
                shelter_id INTEGER REFERENCES shelters(id),
                room_id INTEGER REFERENCES rooms(id),
                intake_date TEXT,
                request_id INTEGER REFERENCES service_requests(id),
                address TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS animal_owners (
                animal_id INTEGER NOT NULL REFERENCES animals(id),
                person_id INTEGER NOT NULL REFERENCES persons(id),
                UNIQUE(animal_id, person_id)
            );

            CREATE TABLE IF NOT EXISTS evac_team_members (
                id INTEGER PRIMARY KEY,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                phone TEXT NOT NULL DEFAULT '',
                agency_id TEXT,
                show INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS dispatch_teams (
                id INTEGER PRIMARY KEY,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                name TEXT NOT NULL,
                dispatch_date TEXT NOT NULL,
                show INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS dispatch_team_members (
                team_id INTEGER NOT NULL REFERENCES dispatch_teams(id),
                member_id INTEGER NOT NULL REFERENCES evac_team_members(id),
                UNIQUE(team_id, member_id)
            );

            CREATE TABLE IF NOT EXISTS evac_assignments (
                id INTEGER PRIMARY KEY,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                id_for_incident INTEGER NOT NULL,
                team_id INTEGER REFERENCES dispatch_teams(id),
                start_time TEXT NOT NULL,
                end_time TEXT,
                closed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(incident_id, id_for_incident)
            );

            CREATE TABLE IF NOT EXISTS assigned_requests (
                id INTEGER PRIMARY KEY,
                assignment_id INTEGER NOT NULL REFERENCES evac_assignments(id),
                service_request_id INTEGER NOT NULL REFERENCES service_requests(id),
                animals TEXT NOT NULL DEFAULT '{}',
                followup_date TEXT,
                owner_contact_id INTEGER REFERENCES owner_contacts(id),
                visit_note_id INTEGER REFERENCES visit_notes(id),
                timestamp TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE(assignment_id, service_request_id)
            );

            CREATE TABLE IF NOT EXISTS visit_notes (
                id INTEGER PRIMARY KEY,
                date_completed TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                forced_entry INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS owner_contacts (
                id INTEGER PRIMARY KEY,
                owner_id INTEGER NOT NULL REFERENCES persons(id),
                note TEXT NOT NULL DEFAULT '',
                contact_time TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sr_incident ON service_requests(incident_id);
            CREATE INDEX IF NOT EXISTS idx_sr_status ON service_requests(status);
            CREATE INDEX IF NOT EXISTS idx_animals_request ON animals(request_id);
            CREATE INDEX IF NOT EXISTS idx_ar_assignment ON assigned_requests(assignment_id);
            CREATE INDEX IF NOT EXISTS idx_ar_request ON assigned_requests(service_request_id);
            CREATE INDEX IF NOT EXISTS idx_ea_team ON evac_assignments(team_id);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` inside a transaction; rolled back on error.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Like `with_tx`, but retries a bounded number of times when a UNIQUE
    /// constraint trips (sequence-number races). Callers never see the race
    /// unless every retry loses.
    pub(crate) fn with_tx_retry<T>(
        &self,
        mut f: impl FnMut(&Transaction) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.with_tx(&mut f);
            match result {
                Err(EngineError::Storage(e)) if is_constraint_violation(&e) => {
                    if attempt >= MAX_TX_RETRIES {
                        return Err(EngineError::Conflict(format!(
                            "sequence assignment lost {} races: {}",
                            attempt, e
                        )));
                    }
                    tracing::warn!("Retrying transaction after uniqueness race: {}", e);
                }
                other => return other,
            }
        }
    }

    /// Read-only access outside a transaction.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let guard = self.conn.lock().unwrap();
        f(&guard)
    }

    // ------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------

    pub fn create_incident(&self, slug: &str, name: &str) -> EngineResult<Incident> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO incidents (slug, name) VALUES (?, ?)",
                params![slug, name],
            )?;
            q::incident_by_slug(tx, slug)?
                .ok_or_else(|| EngineError::Conflict("incident insert vanished".into()))
        })
    }

    pub fn incident_by_slug(&self, slug: &str) -> EngineResult<Option<Incident>> {
        self.with_conn(|conn| q::incident_by_slug(conn, slug))
    }

    pub fn list_incidents(&self) -> EngineResult<Vec<Incident>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, slug, name FROM incidents ORDER BY slug")?;
            let rows = stmt.query_map([], |row| {
                Ok(Incident {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn create_person(&self, new: NewPerson) -> EngineResult<Person> {
        self.with_tx(|tx| {
            tx.execute(
                r#"
                INSERT INTO persons
                    (first_name, last_name, phone, email, address, city, state, is_owner, is_reporter)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    new.first_name,
                    new.last_name,
                    normalize_phone(&new.phone),
                    new.email,
                    new.address,
                    new.city,
                    new.state,
                    new.is_owner,
                    new.is_reporter
                ],
            )?;
            let id = tx.last_insert_rowid();
            q::person_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("person", id))
        })
    }

    pub fn person(&self, id: i64) -> EngineResult<Person> {
        self.with_conn(|conn| {
            q::person_by_id(conn, id)?.ok_or_else(|| EngineError::not_found("person", id))
        })
    }

    pub fn create_shelter(&self, name: &str, address: &str) -> EngineResult<Shelter> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO shelters (name, address) VALUES (?, ?)",
                params![name, address],
            )?;
            let id = tx.last_insert_rowid();
            q::shelter_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("shelter", id))
        })
    }

    pub fn shelter(&self, id: i64) -> EngineResult<Shelter> {
        self.with_conn(|conn| {
            q::shelter_by_id(conn, id)?.ok_or_else(|| EngineError::not_found("shelter", id))
        })
    }

    pub fn list_shelters(&self) -> EngineResult<Vec<Shelter>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, address FROM shelters ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(Shelter {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    address: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn create_room(&self, shelter_id: i64, name: &str) -> EngineResult<Room> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO rooms (shelter_id, name) VALUES (?, ?)",
                params![shelter_id, name],
            )?;
            let id = tx.last_insert_rowid();
            Ok(Room {
                id,
                shelter_id,
                name: name.to_string(),
            })
        })
    }

    // ------------------------------------------------------------------
    // Animals
    // ------------------------------------------------------------------

    /// Intake an animal. Placing it in a shelter at creation time marks it
    /// SHELTERED and stamps the intake date.
    pub fn create_animal(&self, new: NewAnimal) -> EngineResult<Animal> {
        self.with_tx(|tx| {
            let incident = q::incident_by_slug(tx, &new.incident_slug)?
                .ok_or_else(|| EngineError::validation(format!(
                    "unknown incident '{}'",
                    new.incident_slug
                )))?;

            let (status, intake_date) = if new.shelter_id.is_some() {
                (AnimalStatus::Sheltered, Some(Utc::now()))
            } else {
                let status = match &new.status {
                    Some(s) => AnimalStatus::parse(s)?,
                    None => AnimalStatus::Reported,
                };
                (status, None)
            };

            tx.execute(
                r#"
                INSERT INTO animals
                    (incident_id, name, species, status, shelter_id, room_id, intake_date,
                     request_id, address, city, state)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    incident.id,
                    new.name,
                    new.species,
                    status.as_str(),
                    new.shelter_id,
                    new.room_id,
                    intake_date,
                    new.request_id,
                    new.address,
                    new.city,
                    new.state
                ],
            )?;
            let id = tx.last_insert_rowid();

            // Animals joining a service request inherit its owners.
            if let Some(request_id) = new.request_id {
                for owner_id in q::sr_owner_ids(tx, request_id)? {
                    tx.execute(
                        "INSERT OR IGNORE INTO animal_owners (animal_id, person_id) VALUES (?, ?)",
                        params![id, owner_id],
                    )?;
                }
            }
            for owner_id in &new.owner_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO animal_owners (animal_id, person_id) VALUES (?, ?)",
                    params![id, owner_id],
                )?;
            }

            q::animal_by_id(tx, id)?.ok_or_else(|| EngineError::not_found("animal", id))
        })
    }

    pub fn animal(&self, id: i64) -> EngineResult<Animal> {
        self.with_conn(|conn| {
            q::animal_by_id(conn, id)?.ok_or_else(|| EngineError::not_found("animal", id))
        })
    }

    pub fn animals_for_request(&self, request_id: i64) -> EngineResult<Vec<Animal>> {
        self.with_conn(|conn| q::animals_for_request(conn, request_id))
    }

    // ------------------------------------------------------------------
    // Service requests
    // ------------------------------------------------------------------

    pub fn service_request(&self, id: i64) -> EngineResult<ServiceRequest> {
        self.with_conn(|conn| {
            q::sr_by_id(conn, id)?.ok_or_else(|| EngineError::not_found("service request", id))
        })
    }

    pub fn list_service_requests(
        &self,
        incident_slug: Option<&str>,
        status: Option<SrStatus>,
    ) -> EngineResult<Vec<ServiceRequest>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT sr.id, sr.incident_id, sr.id_for_incident, sr.address, sr.city, sr.state,
                        sr.latitude, sr.longitude, sr.status, sr.priority, sr.followup_date,
                        sr.injured, sr.accessible, sr.turn_around, sr.reporter_id
                 FROM service_requests sr",
            );
            let mut clauses = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(slug) = incident_slug {
                sql.push_str(" JOIN incidents i ON i.id = sr.incident_id");
                clauses.push("i.slug = ?");
                args.push(Box::new(slug.to_string()));
            }
            if let Some(status) = status {
                clauses.push("sr.status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY sr.id_for_incident");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                q::sr_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn sr_owner_ids(&self, request_id: i64) -> EngineResult<Vec<i64>> {
        self.with_conn(|conn| q::sr_owner_ids(conn, request_id))
    }

    // ------------------------------------------------------------------
    // Teams and members
    // ------------------------------------------------------------------

    pub fn create_team_member(&self, new: NewTeamMember) -> EngineResult<EvacTeamMember> {
        self.with_tx(|tx| {
            let incident = q::incident_by_slug(tx, &new.incident_slug)?
                .ok_or_else(|| EngineError::validation(format!(
                    "unknown incident '{}'",
                    new.incident_slug
                )))?;
            tx.execute(
                r#"
                INSERT INTO evac_team_members (incident_id, first_name, last_name, phone, agency_id, show)
                VALUES (?, ?, ?, ?, ?, 1)
                "#,
                params![
                    incident.id,
                    new.first_name,
                    new.last_name,
                    normalize_phone(&new.phone),
                    new.agency_id
                ],
            )?;
            let id = tx.last_insert_rowid();
            q::team_member_by_id(tx, id)?
                .ok_or_else(|| EngineError::not_found("team member", id))
        })
    }

    pub fn team_member(&self, id: i64) -> EngineResult<EvacTeamMember> {
        self.with_conn(|conn| {
            q::team_member_by_id(conn, id)?
                .ok_or_else(|| EngineError::not_found("team member", id))
        })
    }

    pub fn list_team_members(&self) -> EngineResult<Vec<EvacTeamMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, incident_id, first_name, last_name, phone, agency_id, show
                 FROM evac_team_members ORDER BY last_name, first_name",
            )?;
            let rows = stmt.query_map([], q::team_member_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn team(&self, id: i64) -> EngineResult<DispatchTeam> {
        self.with_conn(|conn| {
            q::team_by_id(conn, id)?.ok_or_else(|| EngineError::not_found("team", id))
        })
    }

    pub fn list_teams(&self) -> EngineResult<Vec<DispatchTeam>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM dispatch_teams ORDER BY dispatch_date DESC",
            )?;
            let ids: Vec<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut teams = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(team) = q::team_by_id(conn, id)? {
                    teams.push(team);
                }
            }
            Ok(teams)
        })
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    pub fn assignment(&self, id: i64) -> EngineResult<EvacAssignment> {
        self.with_conn(|conn| {
            q::assignment_by_id(conn, id)?
                .ok_or_else(|| EngineError::not_found("evacuation assignment", id))
        })
    }

    /// List assignments, optionally only open (end_time null) or closed ones.
    pub fn list_assignments(&self, open: Option<bool>) -> EngineResult<Vec<EvacAssignment>> {
        self.with_conn(|conn| {
            let sql = match open {
                Some(true) => {
                    "SELECT id, incident_id, id_for_incident, team_id, start_time, end_time, closed
                     FROM evac_assignments WHERE end_time IS NULL ORDER BY start_time DESC"
                }
                Some(false) => {
                    "SELECT id, incident_id, id_for_incident, team_id, start_time, end_time, closed
                     FROM evac_assignments WHERE end_time IS NOT NULL ORDER BY start_time DESC"
                }
                None => {
                    "SELECT id, incident_id, id_for_incident, team_id, start_time, end_time, closed
                     FROM evac_assignments ORDER BY start_time DESC"
                }
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], q::assignment_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn assigned_requests_for_assignment(
        &self,
        assignment_id: i64,
    ) -> EngineResult<Vec<AssignedRequest>> {
        self.with_conn(|conn| q::assigned_requests_for_assignment(conn, assignment_id))
    }

    pub fn assigned_request(
        &self,
        assignment_id: i64,
        service_request_id: i64,
    ) -> EngineResult<Option<AssignedRequest>> {
        self.with_conn(|conn| q::assigned_request(conn, assignment_id, service_request_id))
    }

    pub fn visit_note(&self, id: i64) -> EngineResult<VisitNote> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, date_completed, notes, forced_entry FROM visit_notes WHERE id = ?",
                params![id],
                |row| {
                    Ok(VisitNote {
                        id: row.get(0)?,
                        date_completed: row.get(1)?,
                        notes: row.get(2)?,
                        forced_entry: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::not_found("visit note", id))
        })
    }

    pub fn owner_contact(&self, id: i64) -> EngineResult<OwnerContact> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, note, contact_time FROM owner_contacts WHERE id = ?",
                params![id],
                |row| {
                    Ok(OwnerContact {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        note: row.get(2)?,
                        contact_time: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::not_found("owner contact", id))
        })
    }

    /// Entity counts for the health endpoint.
    pub fn counts(&self) -> EngineResult<StoreCounts> {
        self.with_conn(|conn| {
            let count = |table: &str| -> EngineResult<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?)
            };
            Ok(StoreCounts {
                service_requests: count("service_requests")?,
                animals: count("animals")?,
                assignments: count("evac_assignments")?,
                teams: count("dispatch_teams")?,
            })
        })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreCounts {
    pub service_requests: i64,
    pub animals: i64,
    pub assignments: i64,
    pub teams: i64,
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Row-level queries shared by the store facade and the engines. Everything
/// takes a `&Connection` so it composes inside engine transactions.
pub(crate) mod q {
    use super::*;

    pub fn incident_by_slug(conn: &Connection, slug: &str) -> EngineResult<Option<Incident>> {
        Ok(conn
            .query_row(
                "SELECT id, slug, name FROM incidents WHERE slug = ?",
                params![slug],
                |row| {
                    Ok(Incident {
                        id: row.get(0)?,
                        slug: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn person_by_id(conn: &Connection, id: i64) -> EngineResult<Option<Person>> {
        Ok(conn
            .query_row(
                "SELECT id, first_name, last_name, phone, email, address, city, state,
                        is_owner, is_reporter
                 FROM persons WHERE id = ?",
                params![id],
                |row| {
                    Ok(Person {
                        id: row.get(0)?,
                        first_name: row.get(1)?,
                        last_name: row.get(2)?,
                        phone: row.get(3)?,
                        email: row.get(4)?,
                        address: row.get(5)?,
                        city: row.get(6)?,
                        state: row.get(7)?,
                        is_owner: row.get(8)?,
                        is_reporter: row.get(9)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn shelter_by_id(conn: &Connection, id: i64) -> EngineResult<Option<Shelter>> {
        Ok(conn
            .query_row(
                "SELECT id, name, address FROM shelters WHERE id = ?",
                params![id],
                |row| {
                    Ok(Shelter {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        address: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn animal_from_row(row: &Row<'_>) -> rusqlite::Result<Animal> {
        Ok(Animal {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            name: row.get(2)?,
            species: row.get(3)?,
            status: AnimalStatus::parse(&row.get::<_, String>(4)?).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "status".into(), rusqlite::types::Type::Text)
            })?,
            shelter_id: row.get(5)?,
            room_id: row.get(6)?,
            intake_date: row.get(7)?,
            request_id: row.get(8)?,
            address: row.get(9)?,
            city: row.get(10)?,
            state: row.get(11)?,
        })
    }

    const ANIMAL_COLS: &str = "id, incident_id, name, species, status, shelter_id, room_id,
                               intake_date, request_id, address, city, state";

    pub fn animal_by_id(conn: &Connection, id: i64) -> EngineResult<Option<Animal>> {
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM animals WHERE id = ?", ANIMAL_COLS),
                params![id],
                animal_from_row,
            )
            .optional()?)
    }

    pub fn animals_for_request(conn: &Connection, request_id: i64) -> EngineResult<Vec<Animal>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM animals WHERE request_id = ? ORDER BY id",
            ANIMAL_COLS
        ))?;
        let rows = stmt.query_map(params![request_id], animal_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn sr_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRequest> {
        Ok(ServiceRequest {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            id_for_incident: row.get(2)?,
            address: row.get(3)?,
            city: row.get(4)?,
            state: row.get(5)?,
            latitude: row.get(6)?,
            longitude: row.get(7)?,
            status: SrStatus::parse(&row.get::<_, String>(8)?).map_err(|_| {
                rusqlite::Error::InvalidColumnType(8, "status".into(), rusqlite::types::Type::Text)
            })?,
            priority: row.get(9)?,
            followup_date: row.get(10)?,
            injured: row.get(11)?,
            accessible: row.get(12)?,
            turn_around: row.get(13)?,
            reporter_id: row.get(14)?,
        })
    }

    const SR_COLS: &str = "id, incident_id, id_for_incident, address, city, state, latitude,
                           longitude, status, priority, followup_date, injured, accessible,
                           turn_around, reporter_id";

    pub fn sr_by_id(conn: &Connection, id: i64) -> EngineResult<Option<ServiceRequest>> {
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM service_requests WHERE id = ?", SR_COLS),
                params![id],
                sr_from_row,
            )
            .optional()?)
    }

    pub fn sr_owner_ids(conn: &Connection, request_id: i64) -> EngineResult<Vec<i64>> {
        let mut stmt =
            conn.prepare("SELECT person_id FROM sr_owners WHERE service_request_id = ?")?;
        let rows = stmt.query_map(params![request_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Next per-incident sequence value for `table`. Must be called inside
    /// the transaction that inserts the row; the UNIQUE constraint on
    /// (incident_id, id_for_incident) is the backstop for races.
    pub fn next_seq(conn: &Connection, table: &str, incident_id: i64) -> EngineResult<i64> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE incident_id = ?", table),
            params![incident_id],
            |row| row.get(0),
        )?;
        Ok(count + 1)
    }

    pub fn team_member_from_row(row: &Row<'_>) -> rusqlite::Result<EvacTeamMember> {
        Ok(EvacTeamMember {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            phone: row.get(4)?,
            agency_id: row.get(5)?,
            show: row.get(6)?,
        })
    }

    pub fn team_member_by_id(conn: &Connection, id: i64) -> EngineResult<Option<EvacTeamMember>> {
        Ok(conn
            .query_row(
                "SELECT id, incident_id, first_name, last_name, phone, agency_id, show
                 FROM evac_team_members WHERE id = ?",
                params![id],
                team_member_from_row,
            )
            .optional()?)
    }

    pub fn team_by_id(conn: &Connection, id: i64) -> EngineResult<Option<DispatchTeam>> {
        let base = conn
            .query_row(
                "SELECT id, incident_id, name, dispatch_date, show FROM dispatch_teams WHERE id = ?",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, incident_id, name, dispatch_date, show)) = base else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT member_id FROM dispatch_team_members WHERE team_id = ? ORDER BY member_id",
        )?;
        let member_ids: Vec<i64> = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(DispatchTeam {
            id,
            incident_id,
            name,
            dispatch_date,
            show,
            member_ids,
        }))
    }

    pub fn team_member_count(conn: &Connection, team_id: i64) -> EngineResult<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM dispatch_team_members WHERE team_id = ?",
            params![team_id],
            |row| row.get(0),
        )?)
    }

    pub fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<EvacAssignment> {
        Ok(EvacAssignment {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            id_for_incident: row.get(2)?,
            team_id: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            closed: row.get(6)?,
        })
    }

    pub fn assignment_by_id(conn: &Connection, id: i64) -> EngineResult<Option<EvacAssignment>> {
        Ok(conn
            .query_row(
                "SELECT id, incident_id, id_for_incident, team_id, start_time, end_time, closed
                 FROM evac_assignments WHERE id = ?",
                params![id],
                assignment_from_row,
            )
            .optional()?)
    }

    pub fn assigned_request_from_row(row: &Row<'_>) -> rusqlite::Result<AssignedRequest> {
        let animals_json: String = row.get(3)?;
        let animals: BTreeMap<i64, AnimalSnapshot> = serde_json::from_str(&animals_json)
            .map_err(|_| {
                rusqlite::Error::InvalidColumnType(3, "animals".into(), rusqlite::types::Type::Text)
            })?;
        Ok(AssignedRequest {
            id: row.get(0)?,
            assignment_id: row.get(1)?,
            service_request_id: row.get(2)?,
            animals,
            followup_date: row.get(4)?,
            owner_contact_id: row.get(5)?,
            visit_note_id: row.get(6)?,
            timestamp: row.get(7)?,
            active: row.get(8)?,
        })
    }

    const AR_COLS: &str = "id, assignment_id, service_request_id, animals, followup_date,
                           owner_contact_id, visit_note_id, timestamp, active";

    pub fn assigned_request(
        conn: &Connection,
        assignment_id: i64,
        service_request_id: i64,
    ) -> EngineResult<Option<AssignedRequest>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM assigned_requests
                     WHERE assignment_id = ? AND service_request_id = ?",
                    AR_COLS
                ),
                params![assignment_id, service_request_id],
                assigned_request_from_row,
            )
            .optional()?)
    }

    pub fn assigned_requests_for_assignment(
        conn: &Connection,
        assignment_id: i64,
    ) -> EngineResult<Vec<AssignedRequest>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM assigned_requests WHERE assignment_id = ? ORDER BY id",
            AR_COLS
        ))?;
        let rows = stmt.query_map(params![assignment_id], assigned_request_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Open-assignment rows for one service request (history rows included;
    /// "open" refers to the owning assignment).
    pub fn open_assigned_requests_for_sr(
        conn: &Connection,
        service_request_id: i64,
    ) -> EngineResult<Vec<AssignedRequest>> {
        let mut stmt = conn.prepare(
            "SELECT ar.id, ar.assignment_id, ar.service_request_id, ar.animals, ar.followup_date,
                    ar.owner_contact_id, ar.visit_note_id, ar.timestamp, ar.active
             FROM assigned_requests ar
             JOIN evac_assignments ea ON ea.id = ar.assignment_id
             WHERE ar.service_request_id = ? AND ea.end_time IS NULL",
        )?;
        let rows = stmt.query_map(params![service_request_id], assigned_request_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn write_snapshot(
        conn: &Connection,
        assigned_request_id: i64,
        animals: &BTreeMap<i64, AnimalSnapshot>,
    ) -> EngineResult<()> {
        let json = serde_json::to_string(animals)?;
        conn.execute(
            "UPDATE assigned_requests SET animals = ? WHERE id = ?",
            params![json, assigned_request_id],
        )?;
        Ok(())
    }

    /// The currently-active open assignment for a service request, if any.
    pub fn active_open_assignment_for_sr(
        conn: &Connection,
        service_request_id: i64,
    ) -> EngineResult<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT ea.id FROM assigned_requests ar
                 JOIN evac_assignments ea ON ea.id = ar.assignment_id
                 WHERE ar.service_request_id = ? AND ar.active = 1 AND ea.end_time IS NULL
                 LIMIT 1",
                params![service_request_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}
