use std::collections::{HashMap, HashSet};

use actix_web::{get, http::StatusCode, post, web, HttpMessage, HttpRequest, HttpResponse};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, Document},
    options::FindOptions,
    Database,
};
use serde_json::Value;
use validator::Validate;

use crate::{
    config::AppState,
    error::AppError,
    handlers::{find_documents, parse_id, respond, respond_list},
    middleware::auth::require_role,
    models::{
        review::{self, CreateReviewDto, Review},
        tour,
        user::{self, Role},
    },
    utils::{
        api_features::{ApiFeatures, ListQuery},
        document::{present, to_json},
    },
};

/// Reviews of one tour with their authors, as embedded in the tour detail.
pub async fn reviews_of(db: &Database, tour: ObjectId) -> Result<Vec<Value>, AppError> {
    let list = ListQuery {
        filter: doc! { "tour": tour },
        sort: doc! { "createdAt": -1 },
        projection: doc! { "__v": 0 },
        skip: None,
        limit: None,
    };

    let found = find_documents(&db.collection(review::COLLECTION), &list).await?;
    populate_authors(db, found).await
}

async fn list_reviews(
    db: &Database,
    base: Document,
    params: &HashMap<String, String>,
) -> Result<HttpResponse, AppError> {
    let list = ApiFeatures::new(base, params, review::FIELDS)
        .filter()?
        .sort()
        .limit_fields()
        .paginate()
        .build();

    let found = find_documents(&db.collection(review::COLLECTION), &list).await?;
    Ok(respond_list("reviews", populate_authors(db, found).await?))
}

#[get("/reviews")]
pub async fn get_reviews(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    list_reviews(&state.db, Document::new(), &query).await
}

#[get("/tours/{tour_id}/reviews")]
pub async fn get_tour_reviews(
    state: web::Data<AppState>,
    tour_id: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    let tour_id = parse_id(&tour_id)?;
    list_reviews(&state.db, doc! { "tour": tour_id }, &query).await
}

#[post("/reviews")]
pub async fn create_review(
    req: HttpRequest,
    state: web::Data<AppState>,
    review_data: web::Json<CreateReviewDto>,
) -> Result<HttpResponse, AppError> {
    insert_review(&req, &state, None, review_data.into_inner()).await
}

#[post("/tours/{tour_id}/reviews")]
pub async fn create_tour_review(
    req: HttpRequest,
    state: web::Data<AppState>,
    tour_id: web::Path<String>,
    review_data: web::Json<CreateReviewDto>,
) -> Result<HttpResponse, AppError> {
    insert_review(&req, &state, Some(tour_id.as_str()), review_data.into_inner()).await
}

/// The path's tour wins over one named in the body.
async fn insert_review(
    req: &HttpRequest,
    state: &AppState,
    path_tour: Option<&str>,
    dto: CreateReviewDto,
) -> Result<HttpResponse, AppError> {
    let author = require_role(&req.extensions(), &[Role::User])?;
    dto.validate()?;

    let tour_id = match path_tour.or(dto.tour.as_deref()) {
        Some(raw) => parse_id(raw)?,
        None => return Err(AppError::validation("Review must belong to a tour")),
    };
    let author_id = author
        .id
        .ok_or_else(|| AppError::Internal("User has no id".into()))?;

    let exists = state
        .db
        .collection::<Document>(tour::COLLECTION)
        .count_documents(tour::visible(doc! { "_id": tour_id }), None)
        .await?;
    if exists == 0 {
        return Err(AppError::not_found("No tour found with that ID"));
    }

    let mut new_review = Review::new(dto, author_id, tour_id);
    let inserted = state
        .db
        .collection::<Review>(review::COLLECTION)
        .insert_one(&new_review, None)
        .await?;
    new_review.id = inserted.inserted_id.as_object_id();

    log::info!("{} reviewed tour {}", author.email, tour_id);
    Ok(respond(StatusCode::CREATED, "review", present(&new_review)?))
}

/// Swaps each review's `user` id for the author's name and photo.
async fn populate_authors(db: &Database, reviews: Vec<Document>) -> Result<Vec<Value>, AppError> {
    let ids: HashSet<ObjectId> = reviews
        .iter()
        .filter_map(|r| r.get_object_id("user").ok())
        .collect();

    let mut authors: HashMap<String, Value> = HashMap::new();
    if !ids.is_empty() {
        let options = FindOptions::builder()
            .projection(doc! { "name": 1, "photo": 1 })
            .build();
        let cursor = db
            .collection::<Document>(user::COLLECTION)
            .find(
                user::active(doc! { "_id": { "$in": ids.into_iter().collect::<Vec<_>>() } }),
                options,
            )
            .await?;
        let found: Vec<Document> = cursor.try_collect().await?;
        for author in found {
            if let Ok(id) = author.get_object_id("_id") {
                authors.insert(id.to_hex(), to_json(author));
            }
        }
    }

    Ok(reviews
        .into_iter()
        .map(|r| attach_author(to_json(r), &authors))
        .collect())
}

fn attach_author(mut json: Value, authors: &HashMap<String, Value>) -> Value {
    if let Value::Object(map) = &mut json {
        let author = map
            .get("user")
            .and_then(Value::as_str)
            .and_then(|id| authors.get(id))
            .cloned()
            .unwrap_or(Value::Null);
        map.insert("user".to_string(), author);
    }
    json
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn authors_replace_ids() {
        let id = ObjectId::new();
        let mut authors = HashMap::new();
        authors.insert(
            id.to_hex(),
            json!({ "_id": id.to_hex(), "name": "Lourdes Browning", "photo": "user-2.jpg" }),
        );

        let review = json!({ "review": "Cras mollis nisi parturient", "rating": 5, "user": id.to_hex() });
        let populated = attach_author(review, &authors);
        assert_eq!(populated["user"]["name"], "Lourdes Browning");
        assert_eq!(populated["rating"], 5);
    }

    #[test]
    fn missing_authors_become_null() {
        let review = json!({ "review": "Tempus curabitur", "user": ObjectId::new().to_hex() });
        let populated = attach_author(review, &HashMap::new());
        assert!(populated["user"].is_null());
    }

    #[test]
    fn unrelated_map_entries_survive() {
        let mut map = Map::new();
        map.insert("rating".into(), json!(4));
        let populated = attach_author(Value::Object(map), &HashMap::new());
        assert_eq!(populated["rating"], 4);
        assert!(populated["user"].is_null());
    }
}
