use serde::{Deserialize, Serialize};

/// Identifier of a service plan.
///
/// Trial plans get smaller clusters and skip the paid add-ons; several steps
/// are gated on [`PlanId::is_trial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Standard,
    Lite,
    Trial,
}

impl PlanId {
    /// All plans served by the catalog.
    pub const ALL: [PlanId; 3] = [PlanId::Standard, PlanId::Lite, PlanId::Trial];

    pub fn is_trial(&self) -> bool {
        matches!(self, PlanId::Trial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Standard => "standard",
            PlanId::Lite => "lite",
            PlanId::Trial => "trial",
        }
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanId {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(PlanId::Standard),
            "lite" => Ok(PlanId::Lite),
            "trial" => Ok(PlanId::Trial),
            other => Err(UnknownPlan(other.to_string())),
        }
    }
}

/// Error returned when a plan name is not part of the catalog.
#[derive(Debug, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_str() {
        for plan in PlanId::ALL {
            assert_eq!(plan.as_str().parse::<PlanId>().unwrap(), plan);
        }
    }

    #[test]
    fn test_only_trial_is_trial() {
        assert!(PlanId::Trial.is_trial());
        assert!(!PlanId::Standard.is_trial());
        assert!(!PlanId::Lite.is_trial());
    }
}
