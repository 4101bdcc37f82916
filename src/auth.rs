use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

use crate::config::AuthConfig;
use crate::error::{AuthError, ConfigError};

/// Claims we consume from the identity provider's tokens. Keycloak issues
/// `preferred_username` and `realm_access.roles`; scopes are the standard
/// space-delimited `scope` claim.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
}

#[derive(Debug, Deserialize, Default)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// Derived once per request from the bearer credential and attached
/// read-only to every resolution node that needs a capability check.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    /// `None` marks the anonymous context (no credential presented).
    pub subject: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub scopes: HashSet<String>,
    pub roles: Vec<String>,
    pub expires_at: Option<i64>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        AuthContext {
            subject: None,
            username: None,
            email: None,
            scopes: HashSet::new(),
            roles: Vec::new(),
            expires_at: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.subject.is_some()
    }

    /// A capability is granted either as an OAuth scope or as a realm role.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.roles.iter().any(|r| r == scope)
    }

    /// Root-operation gate, applied before plan construction. Anonymous
    /// callers are told to authenticate; authenticated callers lacking the
    /// scope are refused outright.
    pub fn check_root(&self, required_scope: Option<&str>) -> Result<(), AuthError> {
        let Some(scope) = required_scope else {
            return Ok(());
        };
        if !self.is_authenticated() {
            return Err(AuthError::Unauthenticated);
        }
        if !self.has_scope(scope) {
            return Err(AuthError::Unauthorized(scope.to_string()));
        }
        Ok(())
    }

    /// Per-field capability check, run before a node's backend call is
    /// dispatched. Failures never reach the backend.
    pub fn check_field(
        &self,
        requires_auth: bool,
        required_scope: Option<&str>,
    ) -> Result<(), AuthError> {
        if (requires_auth || required_scope.is_some()) && !self.is_authenticated() {
            return Err(AuthError::Unauthorized("authenticated".to_string()));
        }
        if let Some(scope) = required_scope {
            if !self.has_scope(scope) {
                return Err(AuthError::Unauthorized(scope.to_string()));
            }
        }
        Ok(())
    }
}

struct VerificationMaterial {
    decoding_key: DecodingKey,
    validation: Validation,
}

/// Validates inbound bearer credentials against the identity provider's
/// published verification material.
///
/// The material is shared read-only across requests and refreshed
/// out-of-band via [`AuthGuard::install_rs256_key`]; in-flight requests keep
/// using the old key until the swap completes.
pub struct AuthGuard {
    issuer: String,
    leeway_secs: u64,
    material: RwLock<VerificationMaterial>,
}

impl AuthGuard {
    pub fn from_config(config: &AuthConfig, base_dir: &Path) -> Result<Self, ConfigError> {
        match (&config.public_key_file, &config.hs256_secret) {
            (Some(path), _) => {
                let full_path = base_dir.join(path);
                let pem = std::fs::read(&full_path).map_err(|e| ConfigError::Io {
                    path: full_path.display().to_string(),
                    source: e,
                })?;
                AuthGuard::rs256(&config.issuer, config.leeway_secs, &pem)
            }
            (None, Some(secret)) => Ok(AuthGuard::hs256(
                &config.issuer,
                config.leeway_secs,
                secret.as_bytes(),
            )),
            (None, None) => Err(ConfigError::Auth(
                "set either public_key_file or hs256_secret".to_string(),
            )),
        }
    }

    pub fn rs256(issuer: &str, leeway_secs: u64, pem: &[u8]) -> Result<Self, ConfigError> {
        let decoding_key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| ConfigError::Auth(format!("invalid RSA public key: {e}")))?;
        Ok(AuthGuard::with_key(
            issuer,
            leeway_secs,
            decoding_key,
            Algorithm::RS256,
        ))
    }

    pub fn hs256(issuer: &str, leeway_secs: u64, secret: &[u8]) -> Self {
        AuthGuard::with_key(
            issuer,
            leeway_secs,
            DecodingKey::from_secret(secret),
            Algorithm::HS256,
        )
    }

    fn with_key(issuer: &str, leeway_secs: u64, decoding_key: DecodingKey, alg: Algorithm) -> Self {
        AuthGuard {
            issuer: issuer.to_string(),
            leeway_secs,
            material: RwLock::new(VerificationMaterial {
                decoding_key,
                validation: build_validation(alg, issuer, leeway_secs),
            }),
        }
    }

    /// Swaps in refreshed verification material (key rotation at the
    /// identity provider). Runs outside the request path.
    pub fn install_rs256_key(&self, pem: &[u8]) -> Result<(), ConfigError> {
        let decoding_key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| ConfigError::Auth(format!("invalid RSA public key: {e}")))?;
        let mut material = self
            .material
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        material.decoding_key = decoding_key;
        material.validation = build_validation(Algorithm::RS256, &self.issuer, self.leeway_secs);
        Ok(())
    }

    /// Validates the bearer credential once per request.
    ///
    /// No credential yields the anonymous context; the graph permits
    /// unauthenticated reads and guarded fields check capabilities per node.
    /// A credential that is present but invalid or expired aborts the whole
    /// request with `Unauthenticated`.
    pub fn authenticate(&self, bearer: Option<&str>) -> Result<AuthContext, AuthError> {
        let Some(token) = bearer else {
            return Ok(AuthContext::anonymous());
        };

        let claims = {
            let material = self
                .material
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            decode::<Claims>(token, &material.decoding_key, &material.validation)
        }
        .map_err(|e| {
            tracing::debug!(error = %e, "bearer token rejected");
            AuthError::Unauthenticated
        })?
        .claims;

        let scopes: HashSet<String> = claims
            .scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(AuthContext {
            subject: Some(claims.sub),
            username: claims.preferred_username,
            email: claims.email,
            scopes,
            roles: claims.realm_access.unwrap_or_default().roles,
            expires_at: Some(claims.exp),
        })
    }
}

fn build_validation(alg: Algorithm, issuer: &str, leeway_secs: u64) -> Validation {
    let mut validation = Validation::new(alg);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation.leeway = leeway_secs;
    validation
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const ISSUER: &str = "https://auth.serendibmall.test/realms/serendibmall";
    const SECRET: &[u8] = b"test-signing-secret";

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn mint(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn guard() -> AuthGuard {
        AuthGuard::hs256(ISSUER, 0, SECRET)
    }

    #[test]
    fn missing_credential_is_anonymous() {
        let ctx = guard().authenticate(None).unwrap();
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx, AuthContext::anonymous());
    }

    #[test]
    fn valid_token_yields_subject_scopes_and_roles() {
        let token = mint(json!({
            "sub": "user-7",
            "iss": ISSUER,
            "exp": now_secs() + 600,
            "preferred_username": "nadia",
            "email": "nadia@example.com",
            "scope": "catalog:write inventory:write",
            "realm_access": {"roles": ["customer"]},
        }));

        let ctx = guard().authenticate(Some(&token)).unwrap();
        assert_eq!(ctx.subject.as_deref(), Some("user-7"));
        assert_eq!(ctx.username.as_deref(), Some("nadia"));
        assert!(ctx.has_scope("catalog:write"));
        assert!(ctx.has_scope("customer"));
        assert!(!ctx.has_scope("orders:admin"));
    }

    #[test]
    fn expired_token_is_unauthenticated() {
        let token = mint(json!({
            "sub": "user-7",
            "iss": ISSUER,
            "exp": now_secs() - 3600,
        }));
        assert_eq!(
            guard().authenticate(Some(&token)),
            Err(AuthError::Unauthenticated)
        );
    }

    #[test]
    fn wrong_issuer_is_unauthenticated() {
        let token = mint(json!({
            "sub": "user-7",
            "iss": "https://somewhere-else.example",
            "exp": now_secs() + 600,
        }));
        assert_eq!(
            guard().authenticate(Some(&token)),
            Err(AuthError::Unauthenticated)
        );
    }

    #[test]
    fn garbage_token_is_unauthenticated() {
        assert_eq!(
            guard().authenticate(Some("not-a-jwt")),
            Err(AuthError::Unauthenticated)
        );
    }

    #[test]
    fn root_gate_distinguishes_anonymous_from_insufficient() {
        let anonymous = AuthContext::anonymous();
        assert_eq!(
            anonymous.check_root(Some("inventory:write")),
            Err(AuthError::Unauthenticated)
        );

        let token = mint(json!({
            "sub": "user-7",
            "iss": ISSUER,
            "exp": now_secs() + 600,
            "scope": "catalog:read",
        }));
        let ctx = guard().authenticate(Some(&token)).unwrap();
        assert_eq!(
            ctx.check_root(Some("inventory:write")),
            Err(AuthError::Unauthorized("inventory:write".to_string()))
        );
        assert_eq!(ctx.check_root(None), Ok(()));
    }

    #[test]
    fn field_check_is_always_unauthorized() {
        let anonymous = AuthContext::anonymous();
        assert!(matches!(
            anonymous.check_field(true, None),
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            anonymous.check_field(false, Some("inventory:write")),
            Err(AuthError::Unauthorized(_))
        ));
        assert_eq!(anonymous.check_field(false, None), Ok(()));
    }
}
