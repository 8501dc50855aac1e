//! Logged-in account state.

use crate::error::{DdpError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Completion handler for login and logout: `Ok` on success, or the error.
pub type AccountHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// The user the client is logged in as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            resume_token: None,
            token_expires: None,
        }
    }

    pub fn with_resume_token(
        mut self,
        token: impl Into<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Self {
        self.resume_token = Some(token.into());
        self.token_expires = expires;
        self
    }

    /// Build an account from a login method's result object.
    ///
    /// The result must carry a string `id`. `token` and `tokenExpires` are
    /// optional; the expiry may be an EJSON date (`{"$date": millis}`), a
    /// bare millisecond timestamp, or an RFC 3339 string.
    pub fn from_login_result(result: &Value) -> Result<Self> {
        let user_id = result
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DdpError::InvalidLogin {
                message: "login result has no user id".to_string(),
            })?;

        let resume_token = result
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string);
        let token_expires = result.get("tokenExpires").and_then(parse_date);

        Ok(Self {
            user_id: user_id.to_string(),
            resume_token,
            token_expires,
        })
    }

    /// Parameters for a `login` call resuming this account's session.
    pub fn resume_params(&self) -> Option<Vec<Value>> {
        self.resume_token
            .as_ref()
            .map(|token| vec![json!({ "resume": token })])
    }

    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires.is_some_and(|expires| expires <= now)
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) => map.get("$date").and_then(parse_date),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

/// Account state as seen by observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSnapshot {
    pub account: Option<Account>,
    /// True while a login (including a resume login) awaits its result.
    pub logging_in: bool,
}

impl AccountSnapshot {
    pub fn user_id(&self) -> Option<&str> {
        self.account.as_ref().map(|a| a.user_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_login_result() {
        let account = Account::from_login_result(&json!({
            "id": "user-1",
            "token": "tok",
            "tokenExpires": {"$date": 1_700_000_000_000i64}
        }))
        .unwrap();
        assert_eq!(account.user_id, "user-1");
        assert_eq!(account.resume_token.as_deref(), Some("tok"));
        assert_eq!(
            account.token_expires,
            Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
        );
    }

    #[test]
    fn test_login_result_without_id_is_invalid() {
        let err = Account::from_login_result(&json!({"token": "tok"})).unwrap_err();
        assert!(matches!(err, DdpError::InvalidLogin { .. }));
        assert!(Account::from_login_result(&json!({"id": 7})).is_err());
        assert!(Account::from_login_result(&json!(null)).is_err());
    }

    #[test]
    fn test_expiry_formats() {
        let account = Account::from_login_result(&json!({
            "id": "u",
            "tokenExpires": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            account.token_expires,
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(!account.is_token_expired(Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap()));
        assert!(account.is_token_expired(Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_resume_params() {
        assert!(Account::new("u").resume_params().is_none());
        let account = Account::new("u").with_resume_token("tok", None);
        assert_eq!(account.resume_params(), Some(vec![json!({"resume": "tok"})]));
        assert!(!account.is_token_expired(Utc::now()));
    }
}
