pub mod auth;
pub mod reviews;
pub mod tours;
pub mod users;

use std::time::Instant;

use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use futures::TryStreamExt;
use mongodb::{
    bson::{oid::ObjectId, Document},
    Collection,
};
use serde_json::{json, Map, Value};

use crate::{error::AppError, utils::api_features::ListQuery};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            // tours: fixed paths before /tours/{id}
            .service(tours::get_top_tours)
            .service(tours::get_tour_stats)
            .service(tours::get_monthly_plan)
            .service(reviews::get_tour_reviews)
            .service(reviews::create_tour_review)
            .service(tours::get_tours)
            .service(tours::create_tour)
            .service(tours::get_tour)
            .service(tours::update_tour)
            .service(tours::delete_tour)
            // reviews
            .service(reviews::get_reviews)
            .service(reviews::create_review)
            // users: fixed paths before /users/{id}
            .service(auth::signup)
            .service(auth::login)
            .service(auth::forgot_password)
            .service(auth::reset_password)
            .service(auth::update_password)
            .service(users::update_me)
            .service(users::delete_me)
            .service(users::get_users)
            .service(users::get_user),
    );
}

pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        AppError::validation(format!("Invalid request body: {}", err)).into()
    })
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        AppError::validation(format!("Invalid query string: {}", err)).into()
    })
}

pub async fn not_found(req: HttpRequest) -> Result<HttpResponse, AppError> {
    Err(AppError::not_found(format!(
        "Can't find {} on this server!",
        req.path()
    )))
}

/// `{ status: "success", data: { <key>: value } }`
pub fn respond(status: StatusCode, key: &str, value: Value) -> HttpResponse {
    let mut data = Map::new();
    data.insert(key.to_string(), value);
    HttpResponse::build(status).json(json!({
        "status": "success",
        "data": data,
    }))
}

/// Same as [`respond`] with a `results` count.
pub fn respond_list(key: &str, items: Vec<Value>) -> HttpResponse {
    let results = items.len();
    let mut data = Map::new();
    data.insert(key.to_string(), Value::Array(items));
    HttpResponse::Ok().json(json!({
        "status": "success",
        "results": results,
        "data": data,
    }))
}

pub fn parse_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::parse_str(raw.trim()).map_err(|_| AppError::Cast {
        path: "_id".to_string(),
        value: raw.to_string(),
    })
}

/// Runs a built list query once and collects the raw documents.
pub async fn find_documents(
    collection: &Collection<Document>,
    query: &ListQuery,
) -> Result<Vec<Document>, AppError> {
    let started = Instant::now();
    let cursor = collection
        .find(query.filter.clone(), query.find_options())
        .await?;
    let documents: Vec<Document> = cursor.try_collect().await?;
    log::debug!(
        "Query on {} took {} milliseconds",
        collection.name(),
        started.elapsed().as_millis()
    );
    Ok(documents)
}

pub async fn aggregate_documents(
    collection: &Collection<Document>,
    pipeline: Vec<Document>,
) -> Result<Vec<Document>, AppError> {
    let cursor = collection.aggregate(pipeline, None).await?;
    Ok(cursor.try_collect().await?)
}
