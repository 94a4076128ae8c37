use std::{
    future::{ready, Ready},
    rc::Rc,
};

use actix_web::{
    dev::{forward_ready, Extensions, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    web, Error, HttpMessage,
};
use chrono::Utc;
use futures::future::LocalBoxFuture;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use mongodb::bson::{doc, oid::ObjectId};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AppState, JwtSettings},
    error::AppError,
    models::user::{self, Role, User},
};

pub const TOKEN_COOKIE: &str = "jwt";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub iat: i64,
    pub exp: i64,
}

pub fn sign_token(user_id: &ObjectId, settings: &JwtSettings) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_hex(),
        iat: now.timestamp(),
        exp: (now + settings.expires_in).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.secret.as_ref()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AuthFailure> {
    let mut validation = Validation::default();
    validation.leeway = 0;

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_ref()), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthFailure::Expired,
            _ => AuthFailure::Invalid,
        })
}

/// Bearer header wins over the cookie.
pub fn token_from(authorization: Option<&str>, cookie: Option<&str>) -> Option<String> {
    let non_empty = |token: &&str| !token.is_empty();
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(non_empty)
        .or_else(|| cookie.map(str::trim).filter(non_empty))
        .map(str::to_string)
}

/// Why a presented token did not produce a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Invalid,
    Expired,
    UserGone,
    PasswordChanged,
    Lookup,
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Invalid => AppError::TokenInvalid,
            AuthFailure::Expired => AppError::TokenExpired,
            AuthFailure::UserGone => {
                AppError::unauthorized("The user belonging to this token does no longer exist.")
            }
            AuthFailure::PasswordChanged => {
                AppError::unauthorized("User recently changed password! Please log in again.")
            }
            AuthFailure::Lookup => AppError::Internal("Could not resolve the token's user".into()),
        }
    }
}

/// Outcome of the token check, stored in request extensions.
#[derive(Debug, Clone)]
pub enum AuthState {
    Authenticated(User),
    Rejected(AuthFailure),
}

/// Rejects a token issued before the user's last password change.
pub fn check_session(user: &User, claims: &Claims) -> Result<(), AuthFailure> {
    if user.changed_password_after(claims.iat) {
        return Err(AuthFailure::PasswordChanged);
    }
    Ok(())
}

async fn resolve(token: &str, state: &AppState) -> AuthState {
    let claims = match verify_token(token, &state.config.jwt.secret) {
        Ok(claims) => claims,
        Err(failure) => return AuthState::Rejected(failure),
    };

    let Ok(id) = ObjectId::parse_str(&claims.sub) else {
        return AuthState::Rejected(AuthFailure::Invalid);
    };

    let found = state
        .db
        .collection::<User>(user::COLLECTION)
        .find_one(user::active(doc! { "_id": id }), None)
        .await;

    match found {
        Ok(Some(user)) => match check_session(&user, &claims) {
            Ok(()) => AuthState::Authenticated(user),
            Err(failure) => AuthState::Rejected(failure),
        },
        Ok(None) => AuthState::Rejected(AuthFailure::UserGone),
        Err(e) => {
            log::error!("Failed to load user for token: {}", e);
            AuthState::Rejected(AuthFailure::Lookup)
        }
    }
}

/// Resolves a bearer token (header or `jwt` cookie) into an [`AuthState`].
/// Requests without a token pass through untouched.
pub struct Authentication;

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthenticationMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        Box::pin(async move {
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let cookie = req.cookie(TOKEN_COOKIE).map(|c| c.value().to_string());

            if let Some(token) = token_from(authorization.as_deref(), cookie.as_deref()) {
                let state = match req.app_data::<web::Data<AppState>>().cloned() {
                    Some(app) => resolve(&token, &app).await,
                    None => AuthState::Rejected(AuthFailure::Lookup),
                };
                if let AuthState::Rejected(failure) = &state {
                    log::warn!("Rejected token on {}: {:?}", req.path(), failure);
                }
                req.extensions_mut().insert(state);
            }

            service.call(req).await
        })
    }
}

/// Resolved user of a request, or the reason there is none.
pub fn require_auth(extensions: &Extensions) -> Result<User, AppError> {
    match extensions.get::<AuthState>() {
        Some(AuthState::Authenticated(user)) => Ok(user.clone()),
        Some(AuthState::Rejected(failure)) => Err((*failure).into()),
        None => Err(AppError::unauthorized(
            "You are not logged in! Please log in to get access.",
        )),
    }
}

/// Result of a role check.
#[derive(Debug, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(String),
}

impl Access {
    pub fn into_result(self) -> Result<(), AppError> {
        match self {
            Access::Allowed => Ok(()),
            Access::Denied(reason) => Err(AppError::forbidden(reason)),
        }
    }
}

pub fn restrict_to(user: &User, roles: &[Role]) -> Access {
    if roles.contains(&user.role) {
        Access::Allowed
    } else {
        Access::Denied("You do not have permission to perform this action".to_string())
    }
}

/// `require_auth` followed by `restrict_to`.
pub fn require_role(extensions: &Extensions, roles: &[Role]) -> Result<User, AppError> {
    let user = require_auth(extensions)?;
    restrict_to(&user, roles).into_result()?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use chrono::Duration;

    const SECRET: &str = "a-very-long-and-secret-signing-key";

    fn settings() -> JwtSettings {
        JwtSettings {
            secret: SECRET.into(),
            expires_in: Duration::days(90),
            cookie_expires_in_days: 90,
        }
    }

    fn user(role: Role) -> User {
        User {
            id: Some(ObjectId::new()),
            name: "Leo".into(),
            email: "leo@example.com".into(),
            photo: None,
            role,
            password: String::new(),
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
            active: true,
            version: 0,
        }
    }

    #[test]
    fn signed_token_names_the_user() {
        let id = ObjectId::new();
        let token = sign_token(&id, &settings()).unwrap();
        let claims = verify_token(&token, SECRET).unwrap();

        assert_eq!(claims.sub, id.to_hex());
        assert_eq!(claims.exp - claims.iat, 90 * 24 * 3600);
    }

    #[test]
    fn wrong_secret_or_garbage_is_invalid() {
        let token = sign_token(&ObjectId::new(), &settings()).unwrap();
        assert_eq!(
            verify_token(&token, "another-secret").unwrap_err(),
            AuthFailure::Invalid
        );
        assert_eq!(
            verify_token("not.a.token", SECRET).unwrap_err(),
            AuthFailure::Invalid
        );
    }

    #[test]
    fn elapsed_token_is_expired() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: ObjectId::new().to_hex(),
            iat: now - 120,
            exp: now - 60,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_ref()),
        )
        .unwrap();

        assert_eq!(verify_token(&token, SECRET).unwrap_err(), AuthFailure::Expired);
        assert!(matches!(
            AppError::from(AuthFailure::Expired),
            AppError::TokenExpired
        ));
    }

    #[test]
    fn header_wins_over_cookie() {
        assert_eq!(
            token_from(Some("Bearer abc"), Some("def")),
            Some("abc".to_string())
        );
        assert_eq!(token_from(None, Some("def")), Some("def".to_string()));
        assert_eq!(token_from(Some("Basic abc"), None), None);
        assert_eq!(token_from(Some("Bearer "), None), None);
        assert_eq!(token_from(None, Some("")), None);
    }

    #[test]
    fn empty_bearer_falls_back_to_cookie() {
        assert_eq!(
            token_from(Some("Bearer "), Some("def")),
            Some("def".to_string())
        );
        assert_eq!(
            token_from(Some("Bearer    "), Some("def")),
            Some("def".to_string())
        );
    }

    #[test]
    fn password_change_invalidates_older_tokens() {
        let mut user = user(Role::User);
        let old = Claims {
            sub: user.id.unwrap().to_hex(),
            iat: Utc::now().timestamp() - 3600,
            exp: Utc::now().timestamp() + 3600,
        };
        assert!(check_session(&user, &old).is_ok());

        user.password_changed_at = Some(User::password_changed_now());
        assert_eq!(
            check_session(&user, &old).unwrap_err(),
            AuthFailure::PasswordChanged
        );

        let token = sign_token(&user.id.unwrap(), &settings()).unwrap();
        let fresh = verify_token(&token, SECRET).unwrap();
        assert!(check_session(&user, &fresh).is_ok());
    }

    #[test]
    fn roles_gate_access() {
        let roles = [Role::Admin, Role::LeadGuide];
        assert_eq!(restrict_to(&user(Role::LeadGuide), &roles), Access::Allowed);
        assert!(matches!(
            restrict_to(&user(Role::Guide), &roles),
            Access::Denied(..)
        ));
        assert!(matches!(
            restrict_to(&user(Role::User), &roles).into_result(),
            Err(AppError::Forbidden(..))
        ));
    }

    #[test]
    fn require_auth_reads_the_stored_state() {
        let req = TestRequest::default().to_http_request();
        assert!(matches!(
            require_auth(&req.extensions()),
            Err(AppError::Unauthorized(..))
        ));

        req.extensions_mut()
            .insert(AuthState::Rejected(AuthFailure::PasswordChanged));
        let err = require_auth(&req.extensions()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "User recently changed password! Please log in again."
        );

        let admin = user(Role::Admin);
        req.extensions_mut()
            .insert(AuthState::Authenticated(admin.clone()));
        let resolved = require_role(&req.extensions(), &[Role::Admin]).unwrap();
        assert_eq!(resolved.id, admin.id);
        assert!(matches!(
            require_role(&req.extensions(), &[Role::User]),
            Err(AppError::Forbidden(..))
        ));
    }
}
