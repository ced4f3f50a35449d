//! Signed, time-bounded session credentials.
//!
//! Two audiences share one HS256 secret: session tokens carry the admitted
//! quota and live as long as the session may, heartbeat tokens are short
//! lived and only authenticate heartbeats. Neither is ever accepted in place
//! of the other.

use jsonwebtoken::{
  Algorithm, DecodingKey, EncodingKey, Header, Validation,
  errors::ErrorKind,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::prelude::*;

const ISSUER: &str = "drival";
const SESSION_AUDIENCE: &str = "drival-session";
const HEARTBEAT_AUDIENCE: &str = "drival-heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
  pub user_id: String,
  pub session_id: String,
  /// Quota granted at issuance
  pub quota_remaining_seconds: i64,
  pub issued_at_ms: i64,
  pub expires_at_ms: i64,
  pub ip_address: Option<String>,
  pub nonce: String,
}

impl SessionToken {
  pub fn remaining_seconds(&self) -> i64 {
    (self.expires_at_ms - utils::now_ms()).max(0) / 1000
  }

  pub fn is_expired(&self) -> bool {
    utils::now_ms() > self.expires_at_ms
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatToken {
  pub user_id: String,
  pub session_id: String,
  pub issued_at_ms: i64,
  pub expires_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
  iss: String,
  aud: String,
  sub: String,
  sid: String,
  quota: i64,
  iat: i64,
  exp: i64,
  iat_ms: i64,
  exp_ms: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  ip: Option<String>,
  nonce: String,
}

impl From<SessionClaims> for SessionToken {
  fn from(claims: SessionClaims) -> Self {
    Self {
      user_id: claims.sub,
      session_id: claims.sid,
      quota_remaining_seconds: claims.quota,
      issued_at_ms: claims.iat_ms,
      expires_at_ms: claims.exp_ms,
      ip_address: claims.ip,
      nonce: claims.nonce,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatClaims {
  iss: String,
  aud: String,
  sub: String,
  sid: String,
  iat: i64,
  exp: i64,
  iat_ms: i64,
  exp_ms: i64,
  jti: String,
}

#[derive(Clone)]
pub struct Tokens {
  encoding: EncodingKey,
  decoding: DecodingKey,
  heartbeat_ttl: Duration,
}

impl Tokens {
  pub fn new(secret: &[u8], heartbeat_ttl: Duration) -> Self {
    Self {
      encoding: EncodingKey::from_secret(secret),
      decoding: DecodingKey::from_secret(secret),
      heartbeat_ttl,
    }
  }

  pub fn issue(
    &self,
    user_id: &str,
    session_id: &str,
    quota_seconds: i64,
    ip_address: Option<&str>,
  ) -> Result<(String, SessionToken)> {
    let now = utils::now_ms();
    self.issue_at(user_id, session_id, quota_seconds, ip_address, now)
  }

  fn issue_at(
    &self,
    user_id: &str,
    session_id: &str,
    quota_seconds: i64,
    ip_address: Option<&str>,
    issued_at_ms: i64,
  ) -> Result<(String, SessionToken)> {
    if quota_seconds <= 0 {
      return Err(Error::Internal(format!(
        "Session quota must be positive, got {quota_seconds}"
      )));
    }

    let expires_at_ms = issued_at_ms + quota_seconds * 1000;
    let claims = SessionClaims {
      iss: ISSUER.into(),
      aud: SESSION_AUDIENCE.into(),
      sub: user_id.into(),
      sid: session_id.into(),
      quota: quota_seconds,
      iat: issued_at_ms / 1000,
      exp: ceil_secs(expires_at_ms),
      iat_ms: issued_at_ms,
      exp_ms: expires_at_ms,
      ip: ip_address.map(Into::into),
      nonce: Uuid::new_v4().simple().to_string(),
    };

    let token = jsonwebtoken::encode(
      &Header::new(Algorithm::HS256),
      &claims,
      &self.encoding,
    )?;

    Ok((token, claims.into()))
  }

  /// Checks signature, issuer, audience and expiry.
  ///
  /// The explicit `exp_ms` comparison matters: the library's own `exp` check
  /// tolerates a leeway and would accept a token that expired seconds ago.
  pub fn verify(&self, token: &str) -> Option<SessionToken> {
    let claims: SessionClaims = self.decode(token, SESSION_AUDIENCE, true)?;
    if claims.exp_ms < utils::now_ms() {
      debug!("Session token for `{}` expired", claims.sid);
      return None;
    }
    Some(claims.into())
  }

  /// Authenticates a session token without enforcing expiry, so an expired
  /// credential can still name the session it belonged to.
  pub fn inspect(&self, token: &str) -> Option<SessionToken> {
    self.decode::<SessionClaims>(token, SESSION_AUDIENCE, false).map(Into::into)
  }

  pub fn issue_heartbeat(
    &self,
    user_id: &str,
    session_id: &str,
  ) -> Result<(String, HeartbeatToken)> {
    let issued_at_ms = utils::now_ms();
    let expires_at_ms = issued_at_ms + self.heartbeat_ttl.as_millis() as i64;

    let claims = HeartbeatClaims {
      iss: ISSUER.into(),
      aud: HEARTBEAT_AUDIENCE.into(),
      sub: user_id.into(),
      sid: session_id.into(),
      iat: issued_at_ms / 1000,
      exp: ceil_secs(expires_at_ms),
      iat_ms: issued_at_ms,
      exp_ms: expires_at_ms,
      jti: Uuid::new_v4().to_string(),
    };

    let token = jsonwebtoken::encode(
      &Header::new(Algorithm::HS256),
      &claims,
      &self.encoding,
    )?;

    Ok((
      token,
      HeartbeatToken {
        user_id: claims.sub,
        session_id: claims.sid,
        issued_at_ms,
        expires_at_ms,
      },
    ))
  }

  pub fn verify_heartbeat(&self, token: &str) -> Option<HeartbeatToken> {
    let claims: HeartbeatClaims = self.decode(token, HEARTBEAT_AUDIENCE, true)?;
    if claims.exp_ms < utils::now_ms() {
      return None;
    }

    Some(HeartbeatToken {
      user_id: claims.sub,
      session_id: claims.sid,
      issued_at_ms: claims.iat_ms,
      expires_at_ms: claims.exp_ms,
    })
  }

  fn decode<T: DeserializeOwned>(
    &self,
    token: &str,
    audience: &str,
    check_exp: bool,
  ) -> Option<T> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
    validation.validate_exp = check_exp;

    match jsonwebtoken::decode::<T>(token, &self.decoding, &validation) {
      Ok(data) => Some(data.claims),
      Err(err) => {
        match err.kind() {
          ErrorKind::ExpiredSignature => debug!("Token expired"),
          kind => debug!("Token rejected: {kind:?}"),
        }
        None
      }
    }
  }
}

fn ceil_secs(ms: i64) -> i64 {
  (ms + 999) / 1000
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tokens() -> Tokens {
    Tokens::new(b"test-secret", Duration::from_secs(300))
  }

  #[test]
  fn test_issue_and_verify() {
    let tokens = tokens();
    let (token, issued) =
      tokens.issue("user-1", "sess_1", 600, Some("10.0.0.1")).unwrap();

    let verified = tokens.verify(&token).unwrap();
    assert_eq!(verified, issued);
    assert_eq!(verified.user_id, "user-1");
    assert_eq!(verified.session_id, "sess_1");
    assert_eq!(verified.ip_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(
      verified.expires_at_ms,
      verified.issued_at_ms + verified.quota_remaining_seconds * 1000
    );
  }

  #[test]
  fn test_nonce_differs_between_issues() {
    let tokens = tokens();
    let (_, first) = tokens.issue("user-1", "sess_1", 60, None).unwrap();
    let (_, second) = tokens.issue("user-1", "sess_1", 60, None).unwrap();
    assert_ne!(first.nonce, second.nonce);
  }

  #[test]
  fn test_rejects_non_positive_quota() {
    let tokens = tokens();
    assert!(tokens.issue("user-1", "sess_1", 0, None).is_err());
    assert!(tokens.issue("user-1", "sess_1", -5, None).is_err());
  }

  #[test]
  fn test_expired_within_library_leeway_is_rejected() {
    let tokens = tokens();
    // expired 20s ago, inside the default 60s `exp` leeway
    let issued_at = utils::now_ms() - 30_000;
    let (token, issued) =
      tokens.issue_at("user-1", "sess_1", 10, None, issued_at).unwrap();

    assert!(issued.is_expired());
    assert_eq!(issued.remaining_seconds(), 0);
    assert!(tokens.verify(&token).is_none());
    assert_eq!(tokens.inspect(&token).unwrap().session_id, "sess_1");
  }

  #[test]
  fn test_wrong_secret_is_rejected() {
    let (token, _) = tokens().issue("user-1", "sess_1", 60, None).unwrap();
    let other = Tokens::new(b"other-secret", Duration::from_secs(300));

    assert!(other.verify(&token).is_none());
    assert!(other.inspect(&token).is_none());
  }

  #[test]
  fn test_garbage_is_rejected() {
    let tokens = tokens();
    assert!(tokens.verify("not-a-token").is_none());
    assert!(tokens.verify_heartbeat("").is_none());
  }

  #[test]
  fn test_audiences_do_not_cross() {
    let tokens = tokens();
    let (session, _) = tokens.issue("user-1", "sess_1", 60, None).unwrap();
    let (heartbeat, _) = tokens.issue_heartbeat("user-1", "sess_1").unwrap();

    assert!(tokens.verify_heartbeat(&session).is_none());
    assert!(tokens.verify(&heartbeat).is_none());
    assert!(tokens.inspect(&heartbeat).is_none());

    let verified = tokens.verify_heartbeat(&heartbeat).unwrap();
    assert_eq!(verified.session_id, "sess_1");
    assert_eq!(verified.expires_at_ms - verified.issued_at_ms, 300_000);
  }

  #[test]
  fn test_remaining_seconds() {
    let (_, issued) = tokens().issue("user-1", "sess_1", 120, None).unwrap();
    let remaining = issued.remaining_seconds();
    assert!((119..=120).contains(&remaining));
    assert!(!issued.is_expired());
  }
}
