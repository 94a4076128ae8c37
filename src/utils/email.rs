use serde::Serialize;

use crate::{config::EmailSettings, error::AppError};

#[derive(Debug, Clone, Serialize)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Outbound mail. `Http` posts to a relay API; `Log` only writes the message
/// to the log, for local development without mail credentials.
pub enum Mailer {
    Http {
        client: reqwest::Client,
        api_url: String,
        api_key: Option<String>,
        from: String,
    },
    Log {
        from: String,
    },
}

impl Mailer {
    pub fn from_settings(settings: &EmailSettings) -> Self {
        match &settings.api_url {
            Some(api_url) => Mailer::Http {
                client: reqwest::Client::new(),
                api_url: api_url.clone(),
                api_key: settings.api_key.clone(),
                from: settings.from.clone(),
            },
            None => {
                log::warn!("EMAIL_API_URL not set, outgoing mail will only be logged");
                Mailer::Log {
                    from: settings.from.clone(),
                }
            }
        }
    }

    pub fn compose(&self, to: &str, subject: &str, text: String) -> Email {
        let from = match self {
            Mailer::Http { from, .. } | Mailer::Log { from } => from.clone(),
        };
        Email {
            from,
            to: to.to_string(),
            subject: subject.to_string(),
            text,
        }
    }

    pub async fn send(&self, email: &Email) -> Result<(), AppError> {
        match self {
            Mailer::Http {
                client,
                api_url,
                api_key,
                ..
            } => {
                let mut request = client.post(api_url).json(email);
                if let Some(key) = api_key {
                    request = request.bearer_auth(key);
                }
                request.send().await?.error_for_status()?;
                log::info!("Sent '{}' to {}", email.subject, email.to);
                Ok(())
            }
            Mailer::Log { .. } => {
                log::info!(
                    "Mail to {} ({}):\n{}",
                    email.to,
                    email.subject,
                    email.text
                );
                Ok(())
            }
        }
    }
}

pub fn password_reset_text(reset_url: &str) -> String {
    format!(
        "Forgot your password? Submit a PATCH request with your new password and \
         passwordConfirm to: {}.\nIf you didn't forget your password, please ignore this email!",
        reset_url
    )
}
