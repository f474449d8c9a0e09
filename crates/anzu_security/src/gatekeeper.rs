//! Bearer-token verification with a trusted-subnet bypass.

use std::net::IpAddr;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ratelimit::RateLimiter;
use crate::subnet::Subnet;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("rate limit exceeded for {subject}")]
    RateLimited { subject: String },

    #[error("auth is not configured (no JWT secret)")]
    NotConfigured,
}

/// Claims carried by locally-verified tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub role: Option<String>,
}

/// How a request was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Peer address inside the trusted subnet; no token needed.
    TrustedSubnet,
    /// Token verified for this subject.
    Authenticated { subject: String },
}

pub struct Gatekeeper {
    trusted_subnet: Option<Subnet>,
    decoding_key: Option<DecodingKey>,
    limiter: RateLimiter,
}

impl Gatekeeper {
    pub fn new(trusted_subnet: Option<Subnet>, jwt_secret: Option<&str>) -> Self {
        Gatekeeper {
            trusted_subnet,
            decoding_key: jwt_secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            limiter: RateLimiter::default(),
        }
    }

    /// Admit or refuse a request from `peer` carrying `bearer_token`.
    ///
    /// Trusted-subnet peers bypass both the token check and the rate
    /// limit. Everyone else needs a valid HMAC JWT and burns one unit of
    /// their per-minute budget.
    pub fn check(
        &self,
        peer: Option<IpAddr>,
        bearer_token: Option<&str>,
    ) -> Result<AuthVerdict, AuthError> {
        if let (Some(subnet), Some(IpAddr::V4(addr))) = (self.trusted_subnet, peer) {
            if subnet.contains(addr) {
                debug!("Request from trusted subnet peer {}", addr);
                return Ok(AuthVerdict::TrustedSubnet);
            }
        }

        let key = self.decoding_key.as_ref().ok_or(AuthError::NotConfigured)?;
        let token = bearer_token.ok_or(AuthError::MissingToken)?;
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let data = decode::<TokenClaims>(token, key, &Validation::new(Algorithm::HS256))?;
        let subject = data.claims.sub;

        if !self.limiter.allow(&subject) {
            return Err(AuthError::RateLimited { subject });
        }
        Ok(AuthVerdict::Authenticated { subject })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::net::Ipv4Addr;

    const SECRET: &str = "test-secret";

    fn token_for(sub: &str, exp_offset_secs: i64) -> String {
        let claims = TokenClaims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
            role: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn gatekeeper() -> Gatekeeper {
        Gatekeeper::new(Some("192.168.1.0/24".parse().unwrap()), Some(SECRET))
    }

    #[test]
    fn test_trusted_subnet_bypasses_token() {
        let gk = gatekeeper();
        let verdict = gk
            .check(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))), None)
            .unwrap();
        assert_eq!(verdict, AuthVerdict::TrustedSubnet);
    }

    #[test]
    fn test_outside_subnet_needs_valid_token() {
        let gk = gatekeeper();
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        assert!(matches!(gk.check(peer, None), Err(AuthError::MissingToken)));

        let verdict = gk
            .check(peer, Some(&format!("Bearer {}", token_for("alice", 3600))))
            .unwrap();
        assert_eq!(
            verdict,
            AuthVerdict::Authenticated {
                subject: "alice".to_string()
            }
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let gk = gatekeeper();
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let result = gk.check(peer, Some(&token_for("alice", -3600)));
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_rate_limit_applies_to_authenticated() {
        let gk = Gatekeeper {
            trusted_subnet: None,
            decoding_key: Some(DecodingKey::from_secret(SECRET.as_bytes())),
            limiter: RateLimiter::new(2, std::time::Duration::from_secs(60)),
        };
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let token = token_for("alice", 3600);

        assert!(gk.check(peer, Some(&token)).is_ok());
        assert!(gk.check(peer, Some(&token)).is_ok());
        assert!(matches!(
            gk.check(peer, Some(&token)),
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_no_secret_configured() {
        let gk = Gatekeeper::new(None, None);
        let result = gk.check(None, Some("Bearer whatever"));
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }
}
