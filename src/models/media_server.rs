use serde::Deserialize;

/// Cached challenge-response state for one control-API session.
#[derive(Debug, Clone)]
pub struct AuthCredential {
    pub challenge: String,
    pub response_hash: String,
}

impl AuthCredential {
    /// The control API expects `MD5(MD5(password) + challenge)`, with the
    /// hex-encoded password hash concatenated raw with the challenge string.
    pub fn answer(password: &str, challenge: &str) -> Self {
        let password_hash = format!("{:x}", md5::compute(password));
        let response_hash = format!("{:x}", md5::compute(format!("{}{}", password_hash, challenge)));

        Self {
            challenge: challenge.to_string(),
            response_hash,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub authorize: Option<AuthorizeResponse>,

    #[serde(default)]
    pub active_streams: Option<Vec<String>>,
}

impl ControlResponse {
    pub fn authorize_status(&self) -> &str {
        self.authorize
            .as_ref()
            .map(|a| a.status.as_str())
            .unwrap_or("OK")
    }

    pub fn challenge(&self) -> Option<&str> {
        self.authorize
            .as_ref()
            .and_then(|a| a.challenge.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    pub status: String,

    #[serde(default)]
    pub challenge: Option<String>,
}
