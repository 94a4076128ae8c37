use std::collections::{HashMap, HashSet};

use actix_web::{delete, get, http::StatusCode, patch, post, web, HttpMessage, HttpRequest, HttpResponse};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, Document},
    options::FindOptions,
    Database,
};
use serde_json::Value;

use crate::{
    config::AppState,
    error::AppError,
    handlers::{aggregate_documents, find_documents, parse_id, respond, respond_list, reviews},
    middleware::auth::{require_auth, require_role},
    models::{
        tour::{self, CreateTourDto, Tour, UpdateTourDto},
        user::{self, Role},
    },
    utils::{api_features::ApiFeatures, document::to_json},
};

const TOUR_EDITORS: [Role; 2] = [Role::Admin, Role::LeadGuide];

async fn list_tours(
    db: &Database,
    params: &HashMap<String, String>,
) -> Result<HttpResponse, AppError> {
    let mut list = ApiFeatures::new(Document::new(), params, tour::FIELDS)
        .filter()?
        .sort()
        .limit_fields()
        .paginate()
        .build();
    list.filter = tour::visible(list.filter);

    let tours = find_documents(&db.collection(tour::COLLECTION), &list)
        .await?
        .into_iter()
        .map(|doc| tour::with_virtuals(to_json(doc)))
        .collect();

    Ok(respond_list("tours", tours))
}

#[get("/tours")]
pub async fn get_tours(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    require_auth(&req.extensions())?;
    list_tours(&state.db, &query).await
}

/// Five best rated tours, cheapest first among equals.
#[get("/tours/top-5-tours")]
pub async fn get_top_tours(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    let mut params = query.into_inner();
    params.insert("limit".into(), "5".into());
    params.insert("sort".into(), "-ratingsAverage,price".into());
    params.insert(
        "fields".into(),
        "name,price,ratingsAverage,summary,difficulty".into(),
    );
    params.entry("page".into()).or_insert_with(|| "1".into());

    list_tours(&state.db, &params).await
}

#[get("/tours/tours-stats")]
pub async fn get_tour_stats(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stats = aggregate_documents(
        &state.db.collection(tour::COLLECTION),
        tour::stats_pipeline(),
    )
    .await?
    .into_iter()
    .map(to_json)
    .collect();

    Ok(respond(StatusCode::OK, "stats", Value::Array(stats)))
}

#[get("/tours/monthly-plan/{year}")]
pub async fn get_monthly_plan(
    req: HttpRequest,
    state: web::Data<AppState>,
    year: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    require_role(
        &req.extensions(),
        &[Role::Admin, Role::LeadGuide, Role::Guide],
    )?;

    let year: i32 = year.trim().parse().map_err(|_| AppError::Cast {
        path: "year".into(),
        value: year.as_str().to_string(),
    })?;

    let plan = aggregate_documents(
        &state.db.collection(tour::COLLECTION),
        tour::monthly_plan_pipeline(year)?,
    )
    .await?
    .into_iter()
    .map(to_json)
    .collect();

    Ok(respond(StatusCode::OK, "plan", Value::Array(plan)))
}

#[get("/tours/{id}")]
pub async fn get_tour(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&id)?;

    let found = state
        .db
        .collection::<Tour>(tour::COLLECTION)
        .find_one(tour::visible(doc! { "_id": id }), None)
        .await?
        .ok_or_else(|| AppError::not_found("No tour found with that ID"))?;

    let mut json = tour::present(&found)?;
    if let Value::Object(map) = &mut json {
        map.insert(
            "guides".into(),
            Value::Array(populate_guides(&state.db, &found.guides).await?),
        );
        map.insert(
            "reviews".into(),
            Value::Array(reviews::reviews_of(&state.db, id).await?),
        );
    }

    Ok(respond(StatusCode::OK, "tour", json))
}

#[post("/tours")]
pub async fn create_tour(
    req: HttpRequest,
    state: web::Data<AppState>,
    tour_data: web::Json<CreateTourDto>,
) -> Result<HttpResponse, AppError> {
    require_role(&req.extensions(), &TOUR_EDITORS)?;

    let mut new_tour = Tour::from_dto(tour_data.into_inner())?;
    ensure_guides(&state.db, &new_tour.guides).await?;

    let inserted = state
        .db
        .collection::<Tour>(tour::COLLECTION)
        .insert_one(&new_tour, None)
        .await?;
    new_tour.id = inserted.inserted_id.as_object_id();

    log::info!("Created tour '{}'", new_tour.name);
    Ok(respond(StatusCode::CREATED, "tour", tour::present(&new_tour)?))
}

#[patch("/tours/{id}")]
pub async fn update_tour(
    req: HttpRequest,
    state: web::Data<AppState>,
    id: web::Path<String>,
    changes: web::Json<UpdateTourDto>,
) -> Result<HttpResponse, AppError> {
    require_role(&req.extensions(), &TOUR_EDITORS)?;
    let id = parse_id(&id)?;

    let tours = state.db.collection::<Tour>(tour::COLLECTION);
    let mut existing = tours
        .find_one(tour::visible(doc! { "_id": id }), None)
        .await?
        .ok_or_else(|| AppError::not_found("No tour found with that ID"))?;

    let changes = changes.into_inner();
    let guides_changed = changes.guides.is_some();
    existing.apply(changes)?;
    if guides_changed {
        ensure_guides(&state.db, &existing.guides).await?;
    }

    let result = tours
        .replace_one(tour::visible(doc! { "_id": id }), &existing, None)
        .await?;
    if result.matched_count == 0 {
        return Err(AppError::not_found("No tour found with that ID"));
    }

    Ok(respond(StatusCode::OK, "tour", tour::present(&existing)?))
}

#[delete("/tours/{id}")]
pub async fn delete_tour(
    req: HttpRequest,
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user = require_role(&req.extensions(), &TOUR_EDITORS)?;
    let id = parse_id(&id)?;

    let result = state
        .db
        .collection::<Document>(tour::COLLECTION)
        .delete_one(tour::visible(doc! { "_id": id }), None)
        .await?;
    if result.deleted_count == 0 {
        return Err(AppError::not_found("No tour found with that ID"));
    }

    log::info!("Tour {} deleted by {}", id, user.email);
    Ok(HttpResponse::NoContent().finish())
}

/// Guides must be active users with the guide or lead-guide role.
async fn ensure_guides(db: &Database, guides: &[ObjectId]) -> Result<(), AppError> {
    let unique: HashSet<ObjectId> = guides.iter().copied().collect();
    if unique.is_empty() {
        return Ok(());
    }
    let ids: Vec<ObjectId> = unique.into_iter().collect();

    let found = db
        .collection::<Document>(user::COLLECTION)
        .count_documents(
            user::active(doc! {
                "_id": { "$in": ids.clone() },
                "role": { "$in": ["guide", "lead-guide"] },
            }),
            None,
        )
        .await?;

    if found as usize != ids.len() {
        return Err(AppError::validation(
            "Guides must be active users with the guide or lead-guide role",
        ));
    }
    Ok(())
}

async fn populate_guides(db: &Database, guides: &[ObjectId]) -> Result<Vec<Value>, AppError> {
    if guides.is_empty() {
        return Ok(Vec::new());
    }

    let options = FindOptions::builder()
        .projection(doc! { "name": 1, "email": 1, "role": 1, "photo": 1 })
        .build();
    let cursor = db
        .collection::<Document>(user::COLLECTION)
        .find(user::active(doc! { "_id": { "$in": guides.to_vec() } }), options)
        .await?;
    let found: Vec<Document> = cursor.try_collect().await?;

    Ok(found.into_iter().map(to_json).collect())
}
