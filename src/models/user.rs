use actix_web::web;
use chrono::{Duration, Utc};
use mongodb::bson::{doc, oid::ObjectId, DateTime, Document};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use validator::{Validate, ValidationError};

use crate::{
    error::AppError,
    utils::api_features::{FieldKind, Schema},
};

pub const COLLECTION: &str = "users";

pub const FIELDS: Schema = &[
    ("_id", FieldKind::Id),
    ("name", FieldKind::Text),
    ("email", FieldKind::Text),
    ("role", FieldKind::Text),
    ("passwordChangedAt", FieldKind::Date),
];

/// Never projected into list responses.
pub const HIDDEN_FIELDS: [&str; 4] = [
    "password",
    "passwordResetToken",
    "passwordResetExpires",
    "active",
];

pub const BCRYPT_COST: u32 = 12;
pub const RESET_TOKEN_TTL_MINUTES: i64 = 10;
const RESET_TOKEN_BYTES: usize = 32;

/// `passwordChangedAt` is backdated by this much so a token issued right after
/// the change is never older than the change itself.
const PASSWORD_CHANGE_SKEW_MS: i64 = 1000;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    User,
    Guide,
    LeadGuide,
    Admin,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default)]
    pub role: Role,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_changed_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_reset_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_reset_expires: Option<DateTime>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(rename = "__v", default)]
    pub version: i32,
}

fn default_active() -> bool {
    true
}

impl User {
    /// True when the password changed after a token issued at `issued_at` (seconds).
    pub fn changed_password_after(&self, issued_at: i64) -> bool {
        match self.password_changed_at {
            Some(changed) => issued_at < changed.timestamp_millis() / 1000,
            None => false,
        }
    }

    /// Stores the hash of a fresh reset token with its expiry and returns the plaintext.
    pub fn create_password_reset_token(&mut self) -> String {
        let mut bytes = [0u8; RESET_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.password_reset_token = Some(hash_reset_token(&token));
        self.password_reset_expires = Some(DateTime::from_millis(
            (Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES)).timestamp_millis(),
        ));
        token
    }

    /// Backdated change time, see [`PASSWORD_CHANGE_SKEW_MS`].
    pub fn password_changed_now() -> DateTime {
        DateTime::from_millis(Utc::now().timestamp_millis() - PASSWORD_CHANGE_SKEW_MS)
    }
}

pub fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Whether `token` has the shape of a token from [`User::create_password_reset_token`].
pub fn is_reset_token(token: &str) -> bool {
    token.len() == RESET_TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Active user holding `hashed_token` whose reset window is still open at `now`.
pub fn reset_lookup(hashed_token: &str, now: DateTime) -> Document {
    active(doc! {
        "passwordResetToken": hashed_token,
        "passwordResetExpires": { "$gt": now },
    })
}

/// Stores the new hash and consumes the reset token in the same write.
pub fn reset_update(password_hash: &str, changed_at: DateTime) -> Document {
    doc! {
        "$set": { "password": password_hash, "passwordChangedAt": changed_at },
        "$unset": { "passwordResetToken": "", "passwordResetExpires": "" },
        "$inc": { "__v": 1 },
    }
}

pub async fn hash_password(plain: String) -> Result<String, AppError> {
    let hashed = web::block(move || bcrypt::hash(plain, BCRYPT_COST)).await??;
    Ok(hashed)
}

pub async fn verify_password(candidate: String, hashed: String) -> Result<bool, AppError> {
    let matches = web::block(move || bcrypt::verify(candidate, &hashed)).await??;
    Ok(matches)
}

/// Restricts a user filter to accounts that have not been deactivated.
pub fn active(mut filter: Document) -> Document {
    if filter.contains_key("active") {
        return doc! { "$and": [filter, { "active": { "$ne": false } }] };
    }
    filter.insert("active", doc! { "$ne": false });
    filter
}

/// Public view of a user.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    pub role: Role,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id.map(|id| id.to_hex()),
            name: user.name.clone(),
            email: user.email.clone(),
            photo: user.photo.clone(),
            role: user.role,
        }
    }
}

fn passwords_match(password: &str, confirm: &str) -> Result<(), ValidationError> {
    if password == confirm {
        return Ok(());
    }
    let mut err = ValidationError::new("password_confirm");
    err.message = Some("Passwords don't match".into());
    Err(err)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "signup_passwords_match", skip_on_field_errors = false))]
pub struct SignupDto {
    #[validate(length(min = 1, message = "Please provide a name"))]
    pub name: String,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
    pub photo: Option<String>,
    #[validate(length(min = 8, message = "Password must have at least 8 characters"))]
    pub password: String,
    pub password_confirm: String,
    pub role: Option<Role>,
}

fn signup_passwords_match(dto: &SignupDto) -> Result<(), ValidationError> {
    passwords_match(&dto.password, &dto.password_confirm)
}

impl SignupDto {
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.email = normalize_email(&self.email);
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginDto {
    #[validate(email(message = "Please provide email and password!"))]
    pub email: String,
    #[validate(length(min = 1, message = "Please provide email and password!"))]
    pub password: String,
}

impl LoginDto {
    pub fn normalize(&mut self) {
        self.email = normalize_email(&self.email);
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordDto {
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
}

impl ForgotPasswordDto {
    pub fn normalize(&mut self) {
        self.email = normalize_email(&self.email);
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "reset_passwords_match", skip_on_field_errors = false))]
pub struct ResetPasswordDto {
    #[validate(length(min = 8, message = "Password must have at least 8 characters"))]
    pub password: String,
    pub password_confirm: String,
}

fn reset_passwords_match(dto: &ResetPasswordDto) -> Result<(), ValidationError> {
    passwords_match(&dto.password, &dto.password_confirm)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "update_passwords_match", skip_on_field_errors = false))]
pub struct UpdatePasswordDto {
    pub password_current: String,
    #[validate(length(min = 8, message = "Password must have at least 8 characters"))]
    pub password: String,
    pub password_confirm: String,
}

fn update_passwords_match(dto: &UpdatePasswordDto) -> Result<(), ValidationError> {
    passwords_match(&dto.password, &dto.password_confirm)
}

/// Profile update. Password fields are accepted only to be refused.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMeDto {
    #[validate(length(min = 1, message = "Please provide a name"))]
    pub name: Option<String>,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: Option<String>,
    pub photo: Option<String>,
    pub password: Option<serde_json::Value>,
    pub password_confirm: Option<serde_json::Value>,
}

impl UpdateMeDto {
    pub fn normalize(&mut self) {
        self.name = self.name.as_ref().map(|n| n.trim().to_string());
        self.email = self.email.as_deref().map(normalize_email);
    }

    pub fn touches_password(&self) -> bool {
        self.password.is_some() || self.password_confirm.is_some()
    }

    /// `$set` document holding only the profile fields that were sent.
    pub fn to_update(&self) -> Document {
        let mut set = Document::new();
        if let Some(name) = &self.name {
            set.insert("name", name.clone());
        }
        if let Some(email) = &self.email {
            set.insert("email", email.clone());
        }
        if let Some(photo) = &self.photo {
            set.insert("photo", photo.clone());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: Some(ObjectId::new()),
            name: "Jonas".into(),
            email: "jonas@example.com".into(),
            photo: None,
            role: Role::default(),
            password: String::new(),
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
            active: true,
            version: 0,
        }
    }

    fn signup(password_confirm: &str) -> SignupDto {
        serde_json::from_value(serde_json::json!({
            "name": " Jonas ",
            "email": " Jonas@Example.COM ",
            "password": "pass1234",
            "passwordConfirm": password_confirm,
        }))
        .unwrap()
    }

    #[test]
    fn roles_use_kebab_case() {
        assert_eq!(serde_json::to_value(Role::LeadGuide).unwrap(), "lead-guide");
        let role: Role = serde_json::from_value("admin".into()).unwrap();
        assert_eq!(role, Role::Admin);
        assert_eq!(Role::default(), Role::User);
    }

    #[test]
    fn signup_requires_matching_confirmation() {
        let mut dto = signup("pass1234");
        dto.normalize();
        assert!(dto.validate().is_ok());
        assert_eq!(dto.email, "jonas@example.com");
        assert_eq!(dto.name, "Jonas");

        let mut dto = signup("pass12345");
        dto.normalize();
        let err = AppError::from(dto.validate().unwrap_err());
        assert_eq!(err.to_string(), "Invalid input data: Passwords don't match");
    }

    #[test]
    fn signup_rejects_short_passwords_and_bad_emails() {
        let mut dto = signup("short");
        dto.password = "short".into();
        dto.email = "nope".into();
        let err = AppError::from(dto.validate().unwrap_err()).to_string();
        assert!(err.contains("Password must have at least 8 characters"));
        assert!(err.contains("Please provide a valid email"));
    }

    #[test]
    fn token_issued_before_change_is_stale() {
        let mut user = user();
        assert!(!user.changed_password_after(0));

        let issued_before = Utc::now().timestamp() - 60;
        user.password_changed_at = Some(User::password_changed_now());
        assert!(user.changed_password_after(issued_before));

        let issued_after = Utc::now().timestamp();
        assert!(!user.changed_password_after(issued_after));
    }

    #[test]
    fn reset_token_is_stored_hashed_with_expiry() {
        let mut user = user();
        let token = user.create_password_reset_token();

        assert_eq!(token.len(), 64);
        let stored = user.password_reset_token.clone().unwrap();
        assert_ne!(stored, token);
        assert_eq!(stored, hash_reset_token(&token));

        let expires = user.password_reset_expires.unwrap().timestamp_millis();
        let ttl = expires - Utc::now().timestamp_millis();
        assert!(ttl > 9 * 60 * 1000 && ttl <= 10 * 60 * 1000);
    }

    #[test]
    fn reset_lookup_closes_after_ten_minutes() {
        let mut user = user();
        let token = user.create_password_reset_token();
        let hashed = hash_reset_token(&token);
        let expires = user.password_reset_expires.unwrap();

        let window_end = |now: DateTime| {
            let lookup = reset_lookup(&hashed, now);
            assert_eq!(lookup.get_str("passwordResetToken").unwrap(), hashed);
            assert_eq!(
                lookup.get_document("active").unwrap(),
                &doc! { "$ne": false }
            );
            *lookup
                .get_document("passwordResetExpires")
                .unwrap()
                .get_datetime("$gt")
                .unwrap()
        };

        // Still open right away.
        assert!(expires > window_end(DateTime::now()));

        // Closed a second past the ten minutes.
        let later = DateTime::from_millis(
            Utc::now().timestamp_millis() + (RESET_TOKEN_TTL_MINUTES * 60 + 1) * 1000,
        );
        assert!(expires <= window_end(later));
    }

    #[test]
    fn reset_update_consumes_the_token() {
        let changed_at = User::password_changed_now();
        let update = reset_update("$2b$12$newhash", changed_at);

        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("password").unwrap(), "$2b$12$newhash");
        assert_eq!(set.get_datetime("passwordChangedAt").unwrap(), &changed_at);

        let unset = update.get_document("$unset").unwrap();
        assert!(unset.contains_key("passwordResetToken"));
        assert!(unset.contains_key("passwordResetExpires"));
    }

    #[test]
    fn only_issued_token_shapes_are_reset_tokens() {
        let mut user = user();
        let token = user.create_password_reset_token();
        assert!(is_reset_token(&token));
        assert!(!is_reset_token("not-a-token"));
        assert!(!is_reset_token(&token[..63]));
        assert!(!is_reset_token(&"z".repeat(64)));
    }

    #[test]
    fn reset_tokens_are_unique() {
        let mut user = user();
        let first = user.create_password_reset_token();
        let second = user.create_password_reset_token();
        assert_ne!(first, second);
    }

    #[test]
    fn inactive_users_are_filtered() {
        assert_eq!(
            active(doc! { "role": "guide" }),
            doc! { "role": "guide", "active": { "$ne": false } }
        );
        assert_eq!(
            active(doc! { "active": false }),
            doc! { "$and": [{ "active": false }, { "active": { "$ne": false } }] }
        );
    }

    #[test]
    fn response_hides_credentials() {
        let mut user = user();
        user.password = "$2b$12$hash".into();
        user.password_reset_token = Some("abc".into());
        let json = serde_json::to_value(UserResponse::from(&user)).unwrap();

        assert_eq!(json["role"], "user");
        assert!(json.get("password").is_none());
        assert!(json.get("passwordResetToken").is_none());
        assert!(json.get("active").is_none());
    }

    #[test]
    fn update_me_only_sets_profile_fields() {
        let mut dto: UpdateMeDto = serde_json::from_value(serde_json::json!({
            "name": "Jonas S",
            "email": "NEW@example.com",
            "role": "admin",
        }))
        .unwrap();
        dto.normalize();
        assert!(!dto.touches_password());
        assert_eq!(
            dto.to_update(),
            doc! { "name": "Jonas S", "email": "new@example.com" }
        );

        let dto: UpdateMeDto =
            serde_json::from_value(serde_json::json!({ "password": "newpass123" })).unwrap();
        assert!(dto.touches_password());
    }

    #[actix_web::test]
    async fn passwords_hash_and_verify() {
        let hashed = hash_password("pass1234".into()).await.unwrap();
        assert!(hashed.starts_with("$2"));
        assert!(hashed.contains("$12$"));
        assert!(verify_password("pass1234".into(), hashed.clone()).await.unwrap());
        assert!(!verify_password("wrong-pass".into(), hashed).await.unwrap());
    }
}
