use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// What `POST /api/agent` resolved for one run before it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValidatedRun {
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub continue_session: bool,
}
