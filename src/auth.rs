use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub roles: Vec<Role>,
}

/// Signing secret and the single configured admin account.
#[derive(Clone)]
pub struct AuthConfig {
    secret: String,
    admin_username: String,
    admin_password: String,
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>, admin_username: impl Into<String>, admin_password: impl Into<String>) -> Self {
        Self { secret: secret.into(), admin_username: admin_username.into(), admin_password: admin_password.into() }
    }

    /// Constant-time-ish credential check; an empty password disables login.
    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        if self.admin_password.is_empty() {
            return false;
        }
        let user_ok = username == self.admin_username;
        let pass_ok = password.len() == self.admin_password.len()
            && password.bytes().zip(self.admin_password.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0;
        user_ok & pass_ok
    }

    /// Validate a JWT and return its claims.
    fn decode_jwt(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)?;
        Ok(data.claims)
    }

    /// 24h admin token.
    pub fn create_jwt(&self, username: &str, roles: Vec<Role>) -> Result<String, jsonwebtoken::errors::Error> {
        let expiration = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;
        let claims = Claims { sub: format!("admin:{username}"), exp: expiration, roles };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
    }
}

/// Extractor yielding validated `Claims`.
pub struct Auth(pub Claims);

impl Auth {
    pub fn is_admin(&self) -> bool {
        self.0.roles.iter().any(|r| matches!(r, Role::Admin))
    }
}

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        let Some(cfg) = req.app_data::<web::Data<AuthConfig>>() else {
            return ready(Err(actix_web::error::ErrorInternalServerError("auth not configured")));
        };
        // Delegate to BearerAuth to parse the header.
        if let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() {
            match cfg.decode_jwt(bearer.token()) {
                Ok(claims) => return ready(Ok(Auth(claims))),
                Err(_) => return ready(Err(actix_web::error::ErrorUnauthorized("Invalid JWT"))),
            }
        }
        ready(Err(actix_web::error::ErrorUnauthorized(
            "Authorization required",
        )))
    }
}
