use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use mongodb::error::{CommandError, ErrorKind, WriteError, WriteFailure};
use serde_json::json;
use validator::ValidationErrors;

use crate::config::{self, Environment};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid input data: {}", describe(.0))]
    InvalidInput(#[from] ValidationErrors),

    #[error("Invalid {path}: {value}.")]
    Cast { path: String, value: String },

    #[error("Duplicate field value: {0}. Please use another value")]
    Duplicate(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Invalid token. Please login again")]
    TokenInvalid,

    #[error("Your token has expired. Please login again")]
    TokenExpired,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Database(mongodb::error::Error),

    #[error("{0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("{0}")]
    Blocking(#[from] actix_web::error::BlockingError),

    #[error("There was an error sending the email. Try again later!")]
    Email(#[from] reqwest::Error),

    #[error("{0}")]
    BsonSer(#[from] mongodb::bson::ser::Error),

    #[error("{0}")]
    BsonDe(#[from] mongodb::bson::de::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Operational errors are anticipated and safe to show to a client as-is.
    pub fn is_operational(&self) -> bool {
        !matches!(
            self,
            Self::Database(..)
                | Self::PasswordHash(..)
                | Self::Blocking(..)
                | Self::BsonSer(..)
                | Self::BsonDe(..)
                | Self::Json(..)
                | Self::Internal(..)
        )
    }

    pub fn render(&self, environment: Environment) -> HttpResponse {
        let status = self.status_code();
        let label = if status.is_client_error() { "fail" } else { "error" };

        match environment {
            Environment::Development => HttpResponse::build(status).json(json!({
                "status": label,
                "message": self.to_string(),
                "error": format!("{:?}", self),
            })),
            Environment::Production if self.is_operational() => {
                HttpResponse::build(status).json(json!({
                    "status": label,
                    "message": self.to_string(),
                }))
            }
            Environment::Production => {
                log::error!("Unexpected error: {:?}", self);
                HttpResponse::InternalServerError().json(json!({
                    "status": "error",
                    "message": "Something went wrong. Please try again!",
                }))
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(..)
            | Self::InvalidInput(..)
            | Self::Cast { .. }
            | Self::Duplicate(..) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(..) | Self::TokenInvalid | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(..) => StatusCode::FORBIDDEN,
            Self::NotFound(..) => StatusCode::NOT_FOUND,
            Self::Database(..)
            | Self::PasswordHash(..)
            | Self::Blocking(..)
            | Self::Email(..)
            | Self::BsonSer(..)
            | Self::BsonDe(..)
            | Self::Json(..)
            | Self::Internal(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        self.render(config::environment())
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        let duplicate = match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(WriteError { code, message, .. }))
            | ErrorKind::Command(CommandError { code, message, .. })
                if *code == DUPLICATE_KEY =>
            {
                Some(message.clone())
            }
            _ => None,
        };

        match duplicate {
            Some(message) => {
                let value = first_quoted(&message).unwrap_or("value").to_string();
                Self::Duplicate(value)
            }
            None => Self::Database(err),
        }
    }
}

fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => message.to_string(),
                None => format!("{} is invalid", field),
            })
        })
        .collect();
    messages.sort();
    messages.join(". ")
}

/// First single- or double-quoted run in a driver message, quotes included.
fn first_quoted(message: &str) -> Option<&str> {
    let start = message.find(|c| c == '"' || c == '\'')?;
    let quote = message[start..].chars().next()?;
    let mut escaped = false;
    for (offset, c) in message[start + 1..].char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            c if c == quote && !escaped => {
                return Some(&message[start..start + 1 + offset + 1]);
            }
            _ => escaped = false,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use std::borrow::Cow;
    use validator::ValidationError;

    async fn body_json(resp: HttpResponse) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn extracts_duplicate_value_from_driver_message() {
        let message = r#"E11000 duplicate key error collection: natours.tours index: name_1 dup key: { name: "The Forest Hiker" }"#;
        assert_eq!(first_quoted(message), Some("\"The Forest Hiker\""));
        assert_eq!(first_quoted("no quotes here"), None);
    }

    #[test]
    fn maps_kinds_to_status_codes() {
        assert_eq!(
            AppError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Duplicate("\"x\"".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::forbidden("no").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::not_found("no").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn cast_and_duplicate_messages_are_readable() {
        let cast = AppError::Cast {
            path: "_id".into(),
            value: "wwwww".into(),
        };
        assert_eq!(cast.to_string(), "Invalid _id: wwwww.");

        let dup = AppError::Duplicate("\"The Snow Adventurer\"".into());
        assert_eq!(
            dup.to_string(),
            "Duplicate field value: \"The Snow Adventurer\". Please use another value"
        );
    }

    #[test]
    fn validator_errors_are_joined() {
        let mut errors = ValidationErrors::new();
        let mut short = ValidationError::new("length");
        short.message = Some(Cow::from("Password is too short"));
        errors.add("password", short);
        errors.add("email", ValidationError::new("email"));

        let err = AppError::from(errors);
        assert_eq!(
            err.to_string(),
            "Invalid input data: Password is too short. email is invalid"
        );
    }

    #[actix_web::test]
    async fn production_hides_unexpected_errors() {
        let resp = AppError::Internal("db pool exploded".into()).render(Environment::Production);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Something went wrong. Please try again!");
        assert!(body.get("error").is_none());
    }

    #[actix_web::test]
    async fn production_shows_operational_errors() {
        let resp = AppError::not_found("No tour found with that ID").render(Environment::Production);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = body_json(resp).await;
        assert_eq!(body["status"], "fail");
        assert_eq!(body["message"], "No tour found with that ID");
    }

    #[actix_web::test]
    async fn development_echoes_detail() {
        let resp = AppError::Internal("db pool exploded".into()).render(Environment::Development);
        let body = body_json(resp).await;
        assert_eq!(body["message"], "db pool exploded");
        assert!(body["error"].as_str().unwrap().contains("Internal"));
    }
}
