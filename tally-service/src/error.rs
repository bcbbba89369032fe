use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Org {org_id} has {count} active systems, exceeding the maximum of {max}")]
    ThresholdExceeded { org_id: String, count: i64, max: i64 },

    #[error("Invariant violated for org {org_id}: {message}")]
    InvariantViolation { org_id: String, message: String },

    #[error("Unmappable fact: {0}")]
    UnmappableFact(String),

    #[error("Publication failed: {0}")]
    PublishFailed(String),

    #[error("Enrichment source unavailable: {0}")]
    EnrichmentUnavailable(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl TallyError {
    /// Only store and publication failures are worth a wholesale retry of the pass.
    pub fn is_transient(&self) -> bool {
        match self {
            TallyError::Store(e) => e.is_transient(),
            TallyError::PublishFailed(_) => true,
            _ => false,
        }
    }
}

impl From<TallyError> for AppError {
    fn from(err: TallyError) -> Self {
        match err {
            TallyError::Store(e) => e,
            e @ TallyError::ThresholdExceeded { .. } => {
                AppError::UnprocessableEntity(anyhow::anyhow!(e.to_string()))
            }
            e @ TallyError::InvariantViolation { .. } => AppError::Conflict(anyhow::anyhow!(e.to_string())),
            TallyError::UnmappableFact(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            TallyError::PublishFailed(e) | TallyError::EnrichmentUnavailable(e) => {
                AppError::BadGateway(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_transience() {
        let transient = TallyError::Store(AppError::ServiceUnavailable);
        assert!(transient.is_transient());
        let permanent = TallyError::Store(AppError::NotFound(anyhow::anyhow!("missing")));
        assert!(!permanent.is_transient());
    }

    #[test]
    fn threshold_maps_to_unprocessable() {
        let err: AppError = TallyError::ThresholdExceeded {
            org_id: "org1".into(),
            count: 11,
            max: 10,
        }
        .into();
        assert!(matches!(err, AppError::UnprocessableEntity(_)));
        assert!(!TallyError::UnmappableFact("x".into()).is_transient());
    }
}
