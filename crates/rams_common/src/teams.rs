//! Dispatch team registry.
//!
//! Teams are mutable rosters of evacuation team members. Whether a team is
//! "assigned" is never stored; it is derived from the open assignments that
//! reference it. Roster edits share the orphan-stamping rule with the
//! dispatch engine: a team emptied while its assignments are still open
//! stamps those rounds once.

use crate::audit::{AuditEvent, AuditLogger, Target};
use crate::dispatch;
use crate::error::{EngineError, EngineResult};
use crate::model::DispatchTeam;
use crate::store::{q, RamsStore};
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// A team plus its derived assignment state, as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamView {
    #[serde(flatten)]
    pub team: DispatchTeam,
    pub is_assigned: bool,
}

pub struct TeamRegistry {
    store: RamsStore,
    audit: AuditLogger,
}

impl TeamRegistry {
    pub fn new(store: RamsStore, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    pub fn create(
        &self,
        actor: &str,
        incident_slug: &str,
        name: &str,
        member_ids: &[i64],
    ) -> EngineResult<DispatchTeam> {
        let team = self.store.with_tx(|tx| {
            let incident = q::incident_by_slug(tx, incident_slug)?.ok_or_else(|| {
                EngineError::validation(format!("unknown incident '{}'", incident_slug))
            })?;
            tx.execute(
                "INSERT INTO dispatch_teams (incident_id, name, dispatch_date, show)
                 VALUES (?, ?, ?, 1)",
                params![incident.id, name, Utc::now()],
            )?;
            let team_id = tx.last_insert_rowid();
            for member_id in member_ids {
                q::team_member_by_id(tx, *member_id)?
                    .ok_or_else(|| EngineError::not_found("team member", *member_id))?;
                tx.execute(
                    "INSERT OR IGNORE INTO dispatch_team_members (team_id, member_id)
                     VALUES (?, ?)",
                    params![team_id, member_id],
                )?;
            }
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))
        })?;

        self.audit.record_or_warn(AuditEvent::new(
            actor,
            "created dispatch team",
            Target::team(team.id),
        ));
        Ok(team)
    }

    /// Add members; already-present members are ignored.
    pub fn add_members(
        &self,
        actor: &str,
        team_id: i64,
        member_ids: &[i64],
    ) -> EngineResult<DispatchTeam> {
        let team = self.store.with_tx(|tx| {
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))?;
            for member_id in member_ids {
                q::team_member_by_id(tx, *member_id)?
                    .ok_or_else(|| EngineError::not_found("team member", *member_id))?;
                tx.execute(
                    "INSERT OR IGNORE INTO dispatch_team_members (team_id, member_id)
                     VALUES (?, ?)",
                    params![team_id, member_id],
                )?;
            }
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))
        })?;

        self.audit.record_or_warn(AuditEvent::new(
            actor,
            "updated dispatch team",
            Target::team(team_id),
        ));
        Ok(team)
    }

    /// Remove one member. Emptying the roster while the team is out on open
    /// assignments stamps those rounds.
    pub fn remove_member(
        &self,
        actor: &str,
        team_id: i64,
        member_id: i64,
    ) -> EngineResult<DispatchTeam> {
        let team = self.store.with_tx(|tx| {
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))?;
            tx.execute(
                "DELETE FROM dispatch_team_members WHERE team_id = ? AND member_id = ?",
                params![team_id, member_id],
            )?;
            if q::team_member_count(tx, team_id)? == 0 {
                dispatch::stamp_orphaned_rounds(tx, team_id)?;
            }
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))
        })?;

        self.audit.record_or_warn(AuditEvent::new(
            actor,
            "updated dispatch team",
            Target::team(team_id),
        ));
        Ok(team)
    }

    /// Hide or unhide a team in pickers. No effect on assignment history.
    pub fn set_visibility(&self, actor: &str, team_id: i64, show: bool) -> EngineResult<()> {
        self.store.with_tx(|tx| {
            q::team_by_id(tx, team_id)?.ok_or_else(|| EngineError::not_found("team", team_id))?;
            tx.execute(
                "UPDATE dispatch_teams SET show = ? WHERE id = ?",
                params![show, team_id],
            )?;
            Ok(())
        })?;

        self.audit.record_or_warn(AuditEvent::new(
            actor,
            "updated dispatch team",
            Target::team(team_id),
        ));
        Ok(())
    }

    pub fn get(&self, team_id: i64) -> EngineResult<TeamView> {
        let team = self.store.team(team_id)?;
        let is_assigned = self.is_assigned(team_id)?;
        Ok(TeamView { team, is_assigned })
    }

    /// All teams with their derived assignment state, hidden ones excluded
    /// unless asked for.
    pub fn list(&self, include_hidden: bool) -> EngineResult<Vec<TeamView>> {
        let teams = self.store.list_teams()?;
        let mut views = Vec::with_capacity(teams.len());
        for team in teams {
            if !include_hidden && !team.show {
                continue;
            }
            let is_assigned = self.is_assigned(team.id)?;
            views.push(TeamView { team, is_assigned });
        }
        Ok(views)
    }

    fn is_assigned(&self, team_id: i64) -> EngineResult<bool> {
        self.store.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM evac_assignments WHERE team_id = ? AND end_time IS NULL
                 )",
                params![team_id],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchEngine;
    use crate::ledger::ServiceRequestLedger;
    use crate::model::{NewAssignment, NewServiceRequest, NewTeamMember, TeamSpec};
    use crate::notify::Notifier;
    use tempfile::tempdir;

    fn fixture() -> (TeamRegistry, RamsStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RamsStore::open_in_memory().unwrap();
        store.create_incident("inc", "Test Incident").unwrap();
        let registry = TeamRegistry::new(store.clone(), AuditLogger::new(dir.path()));
        (registry, store, dir)
    }

    fn make_member(store: &RamsStore, last: &str) -> i64 {
        store
            .create_team_member(NewTeamMember {
                incident_slug: "inc".into(),
                first_name: "Ada".into(),
                last_name: last.into(),
                phone: String::new(),
                agency_id: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_create_and_roster_edits() {
        let (registry, store, _dir) = fixture();
        let m1 = make_member(&store, "Reyes");
        let m2 = make_member(&store, "Okafor");

        let team = registry.create("t", "inc", "Alpha", &[m1]).unwrap();
        assert_eq!(team.member_ids, vec![m1]);

        // Adding twice is idempotent.
        let team = registry.add_members("t", team.id, &[m2, m2]).unwrap();
        assert_eq!(team.member_ids, vec![m1, m2]);

        let team = registry.remove_member("t", team.id, m1).unwrap();
        assert_eq!(team.member_ids, vec![m2]);
    }

    #[test]
    fn test_unknown_member_rejected() {
        let (registry, _store, _dir) = fixture();
        let result = registry.create("t", "inc", "Alpha", &[999]);
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_is_assigned_is_derived() {
        let (registry, store, dir) = fixture();
        let member = make_member(&store, "Reyes");
        let team = registry.create("t", "inc", "Alpha", &[member]).unwrap();
        assert!(!registry.get(team.id).unwrap().is_assigned);

        let audit = AuditLogger::new(dir.path());
        let notify = Notifier::new();
        let ledger = ServiceRequestLedger::new(store.clone(), audit.clone(), notify.clone());
        let dispatch = DispatchEngine::new(store.clone(), audit, notify);
        let sr = ledger
            .create(
                "t",
                NewServiceRequest {
                    incident_slug: "inc".into(),
                    address: "12 Ash Ln".into(),
                    city: String::new(),
                    state: String::new(),
                    latitude: None,
                    longitude: None,
                    priority: 2,
                    followup_date: None,
                    injured: false,
                    accessible: true,
                    turn_around: false,
                    reporter_id: None,
                    owner_ids: vec![],
                },
            )
            .unwrap();
        dispatch
            .create(
                "t",
                NewAssignment {
                    incident_slug: "inc".into(),
                    service_requests: vec![sr.id],
                    team: Some(TeamSpec::Existing { team: team.id }),
                },
            )
            .unwrap();

        assert!(registry.get(team.id).unwrap().is_assigned);
    }

    #[test]
    fn test_hidden_teams_filtered_from_list() {
        let (registry, _store, _dir) = fixture();
        let shown = registry.create("t", "inc", "Alpha", &[]).unwrap();
        let hidden = registry.create("t", "inc", "Bravo", &[]).unwrap();
        registry.set_visibility("t", hidden.id, false).unwrap();

        let visible = registry.list(false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].team.id, shown.id);

        let all = registry.list(true).unwrap();
        assert_eq!(all.len(), 2);
    }
}
