use std::collections::HashMap;

use actix_web::{delete, get, http::StatusCode, patch, web, HttpMessage, HttpRequest, HttpResponse};
use mongodb::{
    bson::{doc, Document},
    options::{FindOneAndUpdateOptions, ReturnDocument},
};
use validator::Validate;

use crate::{
    config::AppState,
    error::AppError,
    handlers::{find_documents, parse_id, respond, respond_list},
    middleware::auth::{require_auth, require_role},
    models::user::{self, Role, UpdateMeDto, User, UserResponse},
    utils::{api_features::ApiFeatures, document::to_json},
};

#[patch("/users/updateMyInfo")]
pub async fn update_me(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdateMeDto>,
) -> Result<HttpResponse, AppError> {
    let current = require_auth(&req.extensions())?;

    let mut dto = body.into_inner();
    if dto.touches_password() {
        return Err(AppError::validation(
            "This route does not support updating password! Please use /updatePassword.",
        ));
    }
    dto.normalize();
    dto.validate()?;

    let set = dto.to_update();
    if set.is_empty() {
        return Ok(respond(
            StatusCode::OK,
            "user",
            serde_json::to_value(UserResponse::from(&current))?,
        ));
    }

    let id = current
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;
    let options = FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build();
    let updated = state
        .db
        .collection::<User>(user::COLLECTION)
        .find_one_and_update(
            user::active(doc! { "_id": id }),
            doc! { "$set": set, "$inc": { "__v": 1 } },
            options,
        )
        .await?
        .ok_or_else(|| AppError::not_found("No user found with that ID"))?;

    Ok(respond(
        StatusCode::OK,
        "user",
        serde_json::to_value(UserResponse::from(&updated))?,
    ))
}

#[delete("/users/deleteMyAccount")]
pub async fn delete_me(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let current = require_auth(&req.extensions())?;
    let id = current
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;

    state
        .db
        .collection::<User>(user::COLLECTION)
        .update_one(doc! { "_id": id }, doc! { "$set": { "active": false } }, None)
        .await?;

    log::info!("User {} deactivated their account", current.email);
    Ok(HttpResponse::NoContent().finish())
}

#[get("/users")]
pub async fn get_users(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    require_role(&req.extensions(), &[Role::Admin])?;

    let mut list = ApiFeatures::new(Document::new(), &query, user::FIELDS)
        .filter()?
        .sort()
        .limit_fields()
        .paginate()
        .hide(&user::HIDDEN_FIELDS)
        .build();
    list.filter = user::active(list.filter);

    let users = find_documents(&state.db.collection(user::COLLECTION), &list)
        .await?
        .into_iter()
        .map(to_json)
        .collect();

    Ok(respond_list("users", users))
}

#[get("/users/{id}")]
pub async fn get_user(
    req: HttpRequest,
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    require_role(&req.extensions(), &[Role::Admin])?;
    let id = parse_id(&id)?;

    let found = state
        .db
        .collection::<User>(user::COLLECTION)
        .find_one(user::active(doc! { "_id": id }), None)
        .await?
        .ok_or_else(|| AppError::not_found("No user found with that ID"))?;

    Ok(respond(
        StatusCode::OK,
        "user",
        serde_json::to_value(UserResponse::from(&found))?,
    ))
}
