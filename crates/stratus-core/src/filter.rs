use chrono::{DateTime, Utc};

use crate::operation::{Operation, OperationKind, OperationState};
use crate::orchestration::{Orchestration, OrchestrationKind, OrchestrationState};

/// Filter for operation listings. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub kinds: Vec<OperationKind>,
    pub states: Vec<OperationState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl OperationFilter {
    pub fn with_states(states: impl Into<Vec<OperationState>>) -> Self {
        Self {
            states: states.into(),
            ..Self::default()
        }
    }

    pub fn matches(&self, operation: &Operation) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&operation.kind()) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&operation.state) {
            return false;
        }
        if let Some(after) = self.created_after {
            if operation.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if operation.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Filter for orchestration listings. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationFilter {
    pub kinds: Vec<OrchestrationKind>,
    pub states: Vec<OrchestrationState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl OrchestrationFilter {
    pub fn with_kind_and_states(
        kind: OrchestrationKind,
        states: impl Into<Vec<OrchestrationState>>,
    ) -> Self {
        Self {
            kinds: vec![kind],
            states: states.into(),
            ..Self::default()
        }
    }

    pub fn matches(&self, orchestration: &Orchestration) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&orchestration.kind) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&orchestration.state) {
            return false;
        }
        if let Some(after) = self.created_after {
            if orchestration.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if orchestration.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Applies `page`/`page_size` to an already-filtered, already-sorted list.
pub fn paginate<T>(items: Vec<T>, page: Option<u32>, page_size: Option<u32>) -> Vec<T> {
    match page_size {
        None => items,
        Some(size) => {
            let page = page.unwrap_or(1).max(1);
            let start = ((page - 1) as usize).saturating_mul(size as usize);
            items
                .into_iter()
                .skip(start)
                .take(size as usize)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ProvisioningParameters;
    use crate::plan::PlanId;

    fn operation() -> Operation {
        Operation::new_provision(
            "inst-1",
            ProvisioningParameters {
                plan: PlanId::Standard,
                region: "westeurope".into(),
                platform_region: None,
                parameters: serde_json::json!({}),
            },
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(OperationFilter::default().matches(&operation()));
    }

    #[test]
    fn test_state_filter_excludes_other_states() {
        let filter = OperationFilter::with_states([OperationState::InProgress]);
        assert!(!filter.matches(&operation()));
    }

    #[test]
    fn test_pagination_slices_by_page() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), Some(2), Some(4)), vec![4, 5, 6, 7]);
        assert_eq!(paginate(items.clone(), None, Some(3)), vec![0, 1, 2]);
        assert_eq!(paginate(items.clone(), Some(4), Some(4)), Vec::<i32>::new());
        assert_eq!(paginate(items.clone(), None, None).len(), 10);
    }
}
