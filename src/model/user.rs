use serde::{Deserialize, Serialize};

/// Sample payload schema published by the seeder and decoded by the
/// default processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tel: Option<String>,
}

impl User {
    pub fn new(id: i64, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
            tel: None,
        }
    }

    pub fn with_tel(mut self, tel: impl Into<String>) -> Self {
        self.tel = Some(tel.into());
        self
    }
}
