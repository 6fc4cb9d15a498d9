//! Status taxonomies for animals and service requests.
//!
//! Wire strings are canonical: animal statuses are the uppercase phrases
//! used by field teams ("SHELTERED IN PLACE"), service request statuses are
//! lowercase. Unknown strings are rejected before any write happens.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Animal lifecycle status. The serde names are the wire strings, so JSON
/// surfaces and `parse` agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimalStatus {
    #[serde(rename = "REPORTED")]
    Reported,
    #[serde(rename = "REUNITED")]
    Reunited,
    #[serde(rename = "SHELTERED")]
    Sheltered,
    #[serde(rename = "SHELTERED IN PLACE")]
    ShelteredInPlace,
    #[serde(rename = "UNABLE TO LOCATE")]
    UnableToLocate,
    #[serde(rename = "NO FURTHER ACTION")]
    NoFurtherAction,
    #[serde(rename = "DECEASED")]
    Deceased,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl AnimalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnimalStatus::Reported => "REPORTED",
            AnimalStatus::Reunited => "REUNITED",
            AnimalStatus::Sheltered => "SHELTERED",
            AnimalStatus::ShelteredInPlace => "SHELTERED IN PLACE",
            AnimalStatus::UnableToLocate => "UNABLE TO LOCATE",
            AnimalStatus::NoFurtherAction => "NO FURTHER ACTION",
            AnimalStatus::Deceased => "DECEASED",
            AnimalStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "REPORTED" => Ok(AnimalStatus::Reported),
            "REUNITED" => Ok(AnimalStatus::Reunited),
            "SHELTERED" => Ok(AnimalStatus::Sheltered),
            "SHELTERED IN PLACE" => Ok(AnimalStatus::ShelteredInPlace),
            "UNABLE TO LOCATE" => Ok(AnimalStatus::UnableToLocate),
            "NO FURTHER ACTION" => Ok(AnimalStatus::NoFurtherAction),
            "DECEASED" => Ok(AnimalStatus::Deceased),
            "CANCELED" => Ok(AnimalStatus::Canceled),
            other => Err(EngineError::validation(format!(
                "unknown animal status '{}'",
                other
            ))),
        }
    }

    /// Still awaiting a field outcome. These are the statuses snapshotted
    /// into a new dispatch round.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            AnimalStatus::Reported | AnimalStatus::ShelteredInPlace | AnimalStatus::UnableToLocate
        )
    }

    /// Counts toward closing a service request.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            AnimalStatus::Reunited
                | AnimalStatus::Sheltered
                | AnimalStatus::NoFurtherAction
                | AnimalStatus::Deceased
        )
    }

    /// Terminal statuses that cancellation and reunite never override.
    pub fn is_final(&self) -> bool {
        matches!(self, AnimalStatus::Deceased | AnimalStatus::NoFurtherAction)
    }

    /// Keeps the owning service request open.
    pub fn keeps_request_open(&self) -> bool {
        matches!(
            self,
            AnimalStatus::ShelteredInPlace | AnimalStatus::UnableToLocate
        )
    }

    /// Statuses that represent the animal being physically placed somewhere,
    /// triggering the one-time intake_date stamp.
    pub fn is_sheltered_state(&self) -> bool {
        matches!(
            self,
            AnimalStatus::Sheltered | AnimalStatus::ShelteredInPlace
        )
    }
}

impl fmt::Display for AnimalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrStatus {
    Reported,
    Assigned,
    Open,
    Closed,
    Canceled,
}

impl SrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrStatus::Reported => "reported",
            SrStatus::Assigned => "assigned",
            SrStatus::Open => "open",
            SrStatus::Closed => "closed",
            SrStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "reported" => Ok(SrStatus::Reported),
            "assigned" => Ok(SrStatus::Assigned),
            "open" => Ok(SrStatus::Open),
            "closed" => Ok(SrStatus::Closed),
            "canceled" => Ok(SrStatus::Canceled),
            other => Err(EngineError::validation(format!(
                "unknown service request status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_animal_status_round_trip() {
        for s in [
            AnimalStatus::Reported,
            AnimalStatus::Reunited,
            AnimalStatus::Sheltered,
            AnimalStatus::ShelteredInPlace,
            AnimalStatus::UnableToLocate,
            AnimalStatus::NoFurtherAction,
            AnimalStatus::Deceased,
            AnimalStatus::Canceled,
        ] {
            assert_eq!(AnimalStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_animal_status_serde_matches_wire_strings() {
        // A status read off any JSON surface must parse back unchanged.
        for s in [
            AnimalStatus::Reported,
            AnimalStatus::Reunited,
            AnimalStatus::Sheltered,
            AnimalStatus::ShelteredInPlace,
            AnimalStatus::UnableToLocate,
            AnimalStatus::NoFurtherAction,
            AnimalStatus::Deceased,
            AnimalStatus::Canceled,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
            assert_eq!(serde_json::from_str::<AnimalStatus>(&json).unwrap(), s);
            assert_eq!(AnimalStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(AnimalStatus::parse("LOST").is_err());
        assert!(SrStatus::parse("pending").is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(AnimalStatus::Reported.is_unresolved());
        assert!(AnimalStatus::ShelteredInPlace.is_unresolved());
        assert!(AnimalStatus::ShelteredInPlace.keeps_request_open());
        assert!(AnimalStatus::UnableToLocate.keeps_request_open());
        assert!(!AnimalStatus::Sheltered.keeps_request_open());
        assert!(AnimalStatus::Sheltered.is_resolved());
        assert!(AnimalStatus::Deceased.is_final());
        assert!(!AnimalStatus::Reunited.is_final());
        assert!(AnimalStatus::ShelteredInPlace.is_sheltered_state());
        assert!(!AnimalStatus::UnableToLocate.is_sheltered_state());
    }
}
