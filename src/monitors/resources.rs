use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvaluation {
    Ok,
    Exceeding,
    StartsToExceed,
    BackToOk,
}

impl ResourceEvaluation {
    pub fn evaluate(
        resource: f32,
        limit: f32,
        grace: usize,
        current_grace: usize,
    ) -> ResourceEvaluation {
        // check, if we are under the limit
        if resource < limit {
            // an alert was raised before, so announce the recovery
            if current_grace > grace {
                return ResourceEvaluation::BackToOk;
            }
            return ResourceEvaluation::Ok;
        }

        // check, if we are _now_ starting to exceed the grace period
        if current_grace == grace {
            return ResourceEvaluation::StartsToExceed;
        }

        ResourceEvaluation::Exceeding
    }

    /// Whether this evaluation should be reported as an alert
    pub fn is_transition(self) -> bool {
        matches!(
            self,
            ResourceEvaluation::StartsToExceed | ResourceEvaluation::BackToOk
        )
    }
}

/// Limit with a grace period, fed one sample at a time
///
/// A value has to stay at or above the limit for `grace` consecutive samples
/// before [`ResourceEvaluation::StartsToExceed`] is reported, and the
/// recovery is only reported once after that.
#[derive(Debug, Clone)]
pub struct Threshold {
    name: String,
    limit: f32,
    grace: usize,
    current_grace: usize,
}

impl Threshold {
    pub fn new(name: impl Into<String>, limit: f32, grace: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            grace,
            current_grace: 0,
        }
    }

    pub fn limit(&self) -> f32 {
        self.limit
    }

    /// Whether the last transition reported was an excess
    pub fn is_exceeded(&self) -> bool {
        self.current_grace > self.grace
    }

    pub fn observe(&mut self, value: f32) -> ResourceEvaluation {
        let evaluation =
            ResourceEvaluation::evaluate(value, self.limit, self.grace, self.current_grace);

        match evaluation {
            ResourceEvaluation::Exceeding | ResourceEvaluation::StartsToExceed => {
                self.current_grace += 1;
            }
            ResourceEvaluation::Ok | ResourceEvaluation::BackToOk => {
                self.current_grace = 0;
            }
        }

        trace!(
            "{}: {value} (max: {}) -> {evaluation:?} ({}/{})",
            self.name, self.limit, self.current_grace, self.grace
        );
        evaluation
    }
}
