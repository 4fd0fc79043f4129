use serde::{Deserialize, Serialize};

/// The signed-in user, as last reported by the server. A snapshot is kept so that screens can
/// still show who is signed in while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}
