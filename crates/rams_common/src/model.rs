//! Domain entities and API payload shapes.
//!
//! Everything here is plain serde data; lifecycle rules live in the engines.

use crate::status::{AnimalStatus, SrStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A disaster incident. Sequence numbers for service requests and dispatch
/// assignments are scoped to one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

/// One person record with role flags instead of subtype inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub is_owner: bool,
    pub is_reporter: bool,
}

impl Person {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shelter {
    pub id: i64,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub shelter_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Animal {
    pub id: i64,
    pub incident_id: i64,
    pub name: String,
    pub species: String,
    pub status: AnimalStatus,
    pub shelter_id: Option<i64>,
    pub room_id: Option<i64>,
    /// Stamped the first time the animal enters a sheltered state, never
    /// overwritten afterward.
    pub intake_date: Option<DateTime<Utc>>,
    pub request_id: Option<i64>,
    pub address: String,
    pub city: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: i64,
    pub incident_id: i64,
    pub id_for_incident: i64,
    pub address: String,
    pub city: String,
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: SrStatus,
    pub priority: i64,
    pub followup_date: Option<DateTime<Utc>>,
    pub injured: bool,
    pub accessible: bool,
    pub turn_around: bool,
    pub reporter_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvacTeamMember {
    pub id: i64,
    pub incident_id: i64,
    pub first_name: String,
    pub last_name: String,
    /// Digits only; formatting is stripped on write.
    pub phone: String,
    pub agency_id: Option<String>,
    pub show: bool,
}

impl EvacTeamMember {
    pub fn display_name(&self) -> String {
        match &self.agency_id {
            Some(agency) if !agency.is_empty() => {
                format!("{}, {} ({})", self.last_name, self.first_name, agency)
            }
            _ => format!("{}, {}", self.last_name, self.first_name),
        }
    }

    /// Render a ten-digit phone as (xxx) xxx-xxxx; anything else passes
    /// through untouched.
    pub fn display_phone(&self) -> String {
        format_phone(&self.phone)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTeam {
    pub id: i64,
    pub incident_id: i64,
    pub name: String,
    pub dispatch_date: DateTime<Utc>,
    pub show: bool,
    pub member_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvacAssignment {
    pub id: i64,
    pub incident_id: i64,
    pub id_for_incident: i64,
    pub team_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub closed: bool,
}

impl EvacAssignment {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Per-animal state captured for one dispatch round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalSnapshot {
    pub status: AnimalStatus,
    /// Shelter id as text; empty until the round places the animal.
    pub shelter: String,
}

/// The per-(service request, assignment) working record. `animals` maps
/// animal id to its snapshot for this round; `active` is the live join to
/// the assignment, cleared on detach while the snapshot stays as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedRequest {
    pub id: i64,
    pub assignment_id: i64,
    pub service_request_id: i64,
    pub animals: BTreeMap<i64, AnimalSnapshot>,
    pub followup_date: Option<DateTime<Utc>>,
    pub owner_contact_id: Option<i64>,
    pub visit_note_id: Option<i64>,
    /// Set once when the team backing this round loses its last member.
    pub timestamp: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitNote {
    pub id: i64,
    pub date_completed: DateTime<Utc>,
    pub notes: String,
    pub forced_entry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerContact {
    pub id: i64,
    pub owner_id: i64,
    pub note: String,
    pub contact_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Request payloads
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPerson {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub is_reporter: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAnimal {
    pub incident_slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub species: String,
    /// Canonical status string; defaults to REPORTED. Ignored when a
    /// shelter is given (placement forces SHELTERED).
    pub status: Option<String>,
    pub shelter_id: Option<i64>,
    pub room_id: Option<i64>,
    pub request_id: Option<i64>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub owner_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTeamMember {
    pub incident_slug: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    pub agency_id: Option<String>,
}

/// Fields accepted when creating a service request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServiceRequest {
    pub incident_slug: String,
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub priority: i64,
    pub followup_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub injured: bool,
    #[serde(default)]
    pub accessible: bool,
    #[serde(default)]
    pub turn_around: bool,
    pub reporter_id: Option<i64>,
    #[serde(default)]
    pub owner_ids: Vec<i64>,
}

/// Patch applied to an existing service request. Absent fields are left
/// alone; `reunite_animals` triggers the bulk reunite path instead of a
/// plain field update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequestPatch {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: Option<String>,
    pub priority: Option<i64>,
    pub followup_date: Option<DateTime<Utc>>,
    pub injured: Option<bool>,
    pub accessible: Option<bool>,
    pub turn_around: Option<bool>,
    #[serde(default)]
    pub reunite_animals: bool,
}

/// Team handed to assignment creation: either an existing team or a new
/// one built inline from members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TeamSpec {
    Existing { team: i64 },
    New { name: String, member_ids: Vec<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAssignment {
    pub incident_slug: String,
    pub service_requests: Vec<i64>,
    pub team: Option<TeamSpec>,
}

/// One animal outcome inside an `sr_updates` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimalOutcome {
    pub id: i64,
    pub status: String,
    /// Shelter id, when the outcome places the animal.
    pub shelter: Option<i64>,
}

/// One per-request entry in a dispatch batch update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrUpdate {
    pub id: i64,
    #[serde(default)]
    pub animals: Vec<AnimalOutcome>,
    pub followup_date: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub forced_entry: bool,
    pub owner_contact_id: Option<i64>,
    #[serde(default)]
    pub owner_contact_note: String,
    pub owner_contact_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub incomplete: bool,
    #[serde(default)]
    pub unable_to_complete: bool,
}

/// Full batch body for updating a dispatch assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentUpdate {
    #[serde(default)]
    pub sr_updates: Vec<SrUpdate>,
    pub new_service_request: Option<i64>,
    #[serde(default)]
    pub new_team_members: Vec<i64>,
    pub remove_team_member: Option<i64>,
}

/// Body of `GET /v1/health`, shared with the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub counts: crate::store::StoreCounts,
}

// ============================================================================
// Helpers
// ============================================================================

/// Strip a phone number down to its digits.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Format a digits-only phone for display.
pub fn format_phone(digits: &str) -> String {
    if digits.len() == 10 && digits.chars().all(|c| c.is_ascii_digit()) {
        format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..])
    } else {
        digits.to_string()
    }
}
