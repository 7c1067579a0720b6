use serde::{Deserialize, Serialize};

/// The authenticated caller, placed in request extensions by the auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: i64,

    #[serde(default)]
    pub username: Option<String>,
}
