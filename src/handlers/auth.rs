use actix_web::{
    cookie::{time::Duration as CookieDuration, Cookie},
    http::StatusCode,
    patch, post, web, HttpMessage, HttpRequest, HttpResponse,
};
use mongodb::{
    bson::{doc, DateTime},
    options::{FindOneAndUpdateOptions, ReturnDocument},
};
use serde_json::json;
use validator::Validate;

use crate::{
    config::{AppState, Environment},
    error::AppError,
    middleware::auth::{require_auth, sign_token, TOKEN_COOKIE},
    models::user::{
        self, hash_password, hash_reset_token, is_reset_token, verify_password, ForgotPasswordDto, LoginDto,
        ResetPasswordDto, SignupDto, UpdatePasswordDto, User, UserResponse,
    },
    utils::email::password_reset_text,
};

/// Signs a token for `user` and sends it both as the `jwt` cookie and in the body.
fn create_send_token(
    user: &User,
    status: StatusCode,
    state: &AppState,
) -> Result<HttpResponse, AppError> {
    let id = user
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;
    let token = sign_token(&id, &state.config.jwt)?;

    let cookie = Cookie::build(TOKEN_COOKIE, token.clone())
        .path("/")
        .http_only(true)
        .secure(state.config.environment == Environment::Production)
        .max_age(CookieDuration::days(state.config.jwt.cookie_expires_in_days))
        .finish();

    Ok(HttpResponse::build(status).cookie(cookie).json(json!({
        "status": "success",
        "token": token,
        "data": { "user": UserResponse::from(user) },
    })))
}

#[post("/users/signup")]
pub async fn signup(
    state: web::Data<AppState>,
    user_data: web::Json<SignupDto>,
) -> Result<HttpResponse, AppError> {
    let mut dto = user_data.into_inner();
    dto.normalize();
    dto.validate()?;

    let mut new_user = User {
        id: None,
        name: dto.name,
        email: dto.email,
        photo: dto.photo,
        role: dto.role.unwrap_or_default(),
        password: hash_password(dto.password).await?,
        password_changed_at: None,
        password_reset_token: None,
        password_reset_expires: None,
        active: true,
        version: 0,
    };

    let inserted = state
        .db
        .collection::<User>(user::COLLECTION)
        .insert_one(&new_user, None)
        .await?;
    new_user.id = inserted.inserted_id.as_object_id();

    log::info!("New user signed up: {}", new_user.email);
    create_send_token(&new_user, StatusCode::CREATED, &state)
}

#[post("/users/login")]
pub async fn login(
    state: web::Data<AppState>,
    login_data: web::Json<LoginDto>,
) -> Result<HttpResponse, AppError> {
    let mut dto = login_data.into_inner();
    dto.normalize();
    dto.validate()?;

    let found = state
        .db
        .collection::<User>(user::COLLECTION)
        .find_one(user::active(doc! { "email": &dto.email }), None)
        .await?;

    // Same answer for an unknown email and a wrong password.
    let incorrect = || AppError::unauthorized("Incorrect email or password");
    let user = found.ok_or_else(incorrect)?;
    if !verify_password(dto.password, user.password.clone()).await? {
        return Err(incorrect());
    }

    create_send_token(&user, StatusCode::OK, &state)
}

#[post("/users/forgotPassword")]
pub async fn forgot_password(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ForgotPasswordDto>,
) -> Result<HttpResponse, AppError> {
    let mut dto = body.into_inner();
    dto.normalize();
    dto.validate()?;

    let users = state.db.collection::<User>(user::COLLECTION);
    let mut user = users
        .find_one(user::active(doc! { "email": &dto.email }), None)
        .await?
        .ok_or_else(|| AppError::not_found("There is no user with that email address."))?;
    let id = user
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;

    let reset_token = user.create_password_reset_token();
    users
        .update_one(
            doc! { "_id": id },
            doc! { "$set": {
                "passwordResetToken": user.password_reset_token.clone(),
                "passwordResetExpires": user.password_reset_expires,
            } },
            None,
        )
        .await?;

    let reset_url = {
        let info = req.connection_info();
        format!(
            "{}://{}/api/v1/users/resetPassword/{}",
            info.scheme(),
            info.host(),
            reset_token
        )
    };
    let email = state.mailer.compose(
        &user.email,
        "Your password reset token (valid for 10 min)",
        password_reset_text(&reset_url),
    );

    if let Err(e) = state.mailer.send(&email).await {
        log::error!("Failed to send reset email to {}: {:?}", user.email, e);
        users
            .update_one(
                doc! { "_id": id },
                doc! { "$unset": { "passwordResetToken": "", "passwordResetExpires": "" } },
                None,
            )
            .await?;
        return Err(e);
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Token sent to email!",
    })))
}

#[patch("/users/resetPassword/{token}")]
pub async fn reset_password(
    state: web::Data<AppState>,
    token: web::Path<String>,
    body: web::Json<ResetPasswordDto>,
) -> Result<HttpResponse, AppError> {
    let dto = body.into_inner();
    dto.validate()?;

    let invalid = || AppError::validation("Token is invalid or has expired");
    if !is_reset_token(token.as_str()) {
        return Err(invalid());
    }

    let hashed_token = hash_reset_token(token.as_str());
    let password = hash_password(dto.password).await?;
    let changed_at = User::password_changed_now();

    // Matching and clearing the token in one update keeps it single-use.
    let options = FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build();
    let user = state
        .db
        .collection::<User>(user::COLLECTION)
        .find_one_and_update(
            user::reset_lookup(&hashed_token, DateTime::now()),
            user::reset_update(&password, changed_at),
            options,
        )
        .await?
        .ok_or_else(invalid)?;

    log::info!("Password reset for {}", user.email);
    create_send_token(&user, StatusCode::OK, &state)
}

#[patch("/users/updatePassword")]
pub async fn update_password(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdatePasswordDto>,
) -> Result<HttpResponse, AppError> {
    let mut user = require_auth(&req.extensions())?;
    let dto = body.into_inner();
    dto.validate()?;

    if !verify_password(dto.password_current, user.password.clone()).await? {
        return Err(AppError::unauthorized("Your current password is wrong."));
    }

    let id = user
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;
    let password = hash_password(dto.password).await?;
    let changed_at = User::password_changed_now();

    let result = state
        .db
        .collection::<User>(user::COLLECTION)
        .update_one(
            user::active(doc! { "_id": id }),
            doc! {
                "$set": { "password": &password, "passwordChangedAt": changed_at },
                "$inc": { "__v": 1 },
            },
            None,
        )
        .await?;
    if result.matched_count == 0 {
        return Err(AppError::unauthorized(
            "The user belonging to this token does no longer exist.",
        ));
    }

    user.password = password;
    user.password_changed_at = Some(changed_at);
    create_send_token(&user, StatusCode::OK, &state)
}
