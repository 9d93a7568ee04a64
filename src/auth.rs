//! Token verification and the capabilities derived from claims. Tokens are
//! HS256 with a shared secret; `exp` is mandatory and enforced.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::models::Direction;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}

/// Claims carried by subscriber tokens. `sub` identifies the vehicle for
/// device tokens and the user otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String,
    /// Route the token is pinned to, for bus and route channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Space-separated scope grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Admin allowlist of "routeId:DIRECTION" entries; absent means every
    /// route is visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_scopes: Option<Vec<String>>,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        let role_admin = matches!(self.role.as_deref(), Some("admin") | Some("system"));
        let scope_admin = self
            .scope
            .as_deref()
            .map(|scope| scope.split_whitespace().any(|grant| grant == "admin"))
            .unwrap_or(false);
        role_admin || scope_admin
    }

    /// Whether an admin token may watch one route/direction.
    pub fn allows_admin_route(&self, route_id: &str, direction: Direction) -> bool {
        match &self.route_scopes {
            None => true,
            Some(scopes) => {
                let needed = format!("{}:{}", route_id, direction.as_str());
                scopes.iter().any(|scope| scope == &needed)
            }
        }
    }
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Checks signature and expiry. The reason for a failure is deliberately
    /// not surfaced to clients.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn make_claims(sub: &str) -> Claims {
        Claims {
            sub: sub.to_string(),
            route_id: Some("R1".to_string()),
            direction: Some(Direction::Forward),
            role: None,
            scope: None,
            route_scopes: None,
            exp: chrono::Utc::now().timestamp() + 3600,
        }
    }

    fn make_token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_round_trip() {
        let verifier = JwtVerifier::new(SECRET);
        let token = make_token(&make_claims("bus-1"), SECRET);

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, "bus-1");
        assert_eq!(claims.route_id.as_deref(), Some("R1"));
        assert_eq!(claims.direction, Some(Direction::Forward));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = make_token(&make_claims("bus-1"), "other-secret");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let mut claims = make_claims("bus-1");
        claims.exp = chrono::Utc::now().timestamp() - 3600;
        let token = make_token(&claims, SECRET);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(verifier.verify("not-a-token").is_err());
        assert!(verifier.verify("").is_err());
    }

    #[test]
    fn test_admin_detection() {
        let mut claims = make_claims("ops-1");
        assert!(!claims.is_admin());

        claims.role = Some("admin".to_string());
        assert!(claims.is_admin());

        claims.role = Some("system".to_string());
        assert!(claims.is_admin());

        claims.role = Some("rider".to_string());
        assert!(!claims.is_admin());

        claims.scope = Some("metrics admin".to_string());
        assert!(claims.is_admin());
    }

    #[test]
    fn test_admin_route_allowlist() {
        let mut claims = make_claims("ops-1");
        claims.role = Some("admin".to_string());

        // No allowlist: everything visible.
        assert!(claims.allows_admin_route("R9", Direction::Backward));

        claims.route_scopes = Some(vec!["R1:FORWARD".to_string(), "R2:BACKWARD".to_string()]);
        assert!(claims.allows_admin_route("R1", Direction::Forward));
        assert!(claims.allows_admin_route("R2", Direction::Backward));
        assert!(!claims.allows_admin_route("R1", Direction::Backward));
        assert!(!claims.allows_admin_route("R9", Direction::Forward));
    }
}
