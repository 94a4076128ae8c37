use chrono::{DateTime as ChronoDateTime, Utc};
use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError};

use crate::{
    error::AppError,
    utils::{
        api_features::{FieldKind, Schema},
        document,
    },
};

pub const COLLECTION: &str = "tours";

pub const FIELDS: Schema = &[
    ("_id", FieldKind::Id),
    ("name", FieldKind::Text),
    ("slug", FieldKind::Text),
    ("duration", FieldKind::Number),
    ("maxGroupSize", FieldKind::Number),
    ("difficulty", FieldKind::Text),
    ("ratingsAverage", FieldKind::Number),
    ("ratingsQuantity", FieldKind::Number),
    ("price", FieldKind::Number),
    ("priceDiscount", FieldKind::Number),
    ("createdAt", FieldKind::Date),
    ("startDates", FieldKind::Date),
    ("secretTour", FieldKind::Boolean),
    ("guides", FieldKind::Id),
];

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Difficult,
}

/// GeoJSON point, `coordinates` as `[lng, lat]`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeoPoint {
    #[serde(rename = "type", default = "point")]
    pub kind: String,
    pub coordinates: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<i32>,
}

fn point() -> String {
    "Point".to_string()
}

impl GeoPoint {
    fn is_valid(&self) -> bool {
        self.kind == "Point"
            && matches!(self.coordinates.as_slice(), [lng, lat]
                if (-180.0..=180.0).contains(lng) && (-90.0..=90.0).contains(lat))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "check_tour", skip_on_field_errors = false))]
pub struct Tour {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[validate(length(min = 10, max = 40, message = "A tour name must have between 10 and 40 characters"))]
    pub name: String,
    pub slug: String,
    #[validate(range(min = 1, message = "A tour must last at least one day"))]
    pub duration: i32,
    #[validate(range(min = 1, message = "A tour must have a group size"))]
    pub max_group_size: i32,
    pub difficulty: Difficulty,
    #[validate(range(min = 1.0, max = 5.0, message = "Rating must be between 1 and 5"))]
    pub ratings_average: f64,
    #[validate(range(min = 0, message = "Ratings quantity can not be negative"))]
    pub ratings_quantity: i32,
    #[validate(range(min = 0.0, message = "A tour must have a price"))]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_discount: Option<f64>,
    #[validate(length(min = 1, message = "A tour must have a summary"))]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[validate(length(min = 1, message = "A tour must have a cover image"))]
    pub image_cover: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub created_at: DateTime,
    #[serde(default)]
    pub start_dates: Vec<DateTime>,
    #[serde(default)]
    pub secret_tour: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location: Option<GeoPoint>,
    #[serde(default)]
    pub locations: Vec<GeoPoint>,
    #[serde(default)]
    pub guides: Vec<ObjectId>,
    #[serde(rename = "__v", default)]
    pub version: i32,
}

fn check_tour(tour: &Tour) -> Result<(), ValidationError> {
    if let Some(discount) = tour.price_discount {
        if discount >= tour.price {
            let mut err = ValidationError::new("price_discount");
            err.message = Some(
                format!(
                    "Discount price ({}) must be less than actual price",
                    discount
                )
                .into(),
            );
            return Err(err);
        }
    }

    let points_ok = tour.start_location.iter().all(GeoPoint::is_valid)
        && tour.locations.iter().all(GeoPoint::is_valid);
    if !points_ok {
        let mut err = ValidationError::new("location");
        err.message = Some("Locations must be GeoJSON points as [lng, lat]".into());
        return Err(err);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTourDto {
    pub name: String,
    pub duration: i32,
    pub max_group_size: i32,
    pub difficulty: Difficulty,
    pub ratings_average: Option<f64>,
    pub ratings_quantity: Option<i32>,
    pub price: f64,
    pub price_discount: Option<f64>,
    pub summary: String,
    pub description: Option<String>,
    pub image_cover: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub start_dates: Vec<ChronoDateTime<Utc>>,
    #[serde(default)]
    pub secret_tour: bool,
    pub start_location: Option<GeoPoint>,
    #[serde(default)]
    pub locations: Vec<GeoPoint>,
    #[serde(default)]
    pub guides: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTourDto {
    pub name: Option<String>,
    pub duration: Option<i32>,
    pub max_group_size: Option<i32>,
    pub difficulty: Option<Difficulty>,
    pub ratings_average: Option<f64>,
    pub ratings_quantity: Option<i32>,
    pub price: Option<f64>,
    pub price_discount: Option<f64>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub image_cover: Option<String>,
    pub images: Option<Vec<String>>,
    pub start_dates: Option<Vec<ChronoDateTime<Utc>>>,
    pub secret_tour: Option<bool>,
    pub start_location: Option<GeoPoint>,
    pub locations: Option<Vec<GeoPoint>>,
    pub guides: Option<Vec<String>>,
}

impl Tour {
    pub fn from_dto(dto: CreateTourDto) -> Result<Self, AppError> {
        let name = dto.name.trim().to_string();
        let tour = Tour {
            id: None,
            slug: slugify(&name),
            name,
            duration: dto.duration,
            max_group_size: dto.max_group_size,
            difficulty: dto.difficulty,
            ratings_average: dto.ratings_average.unwrap_or(4.5),
            ratings_quantity: dto.ratings_quantity.unwrap_or(0),
            price: dto.price,
            price_discount: dto.price_discount,
            summary: dto.summary.trim().to_string(),
            description: dto.description.map(|d| d.trim().to_string()),
            image_cover: dto.image_cover,
            images: dto.images,
            created_at: DateTime::now(),
            start_dates: dto.start_dates.iter().map(to_bson_date).collect(),
            secret_tour: dto.secret_tour,
            start_location: dto.start_location,
            locations: dto.locations,
            guides: parse_ids("guides", &dto.guides)?,
            version: 0,
        };
        tour.validate()?;
        Ok(tour)
    }

    /// Merges a partial update and revalidates the whole tour.
    pub fn apply(&mut self, patch: UpdateTourDto) -> Result<(), AppError> {
        if let Some(name) = patch.name {
            self.name = name.trim().to_string();
            self.slug = slugify(&self.name);
        }
        if let Some(v) = patch.duration {
            self.duration = v;
        }
        if let Some(v) = patch.max_group_size {
            self.max_group_size = v;
        }
        if let Some(v) = patch.difficulty {
            self.difficulty = v;
        }
        if let Some(v) = patch.ratings_average {
            self.ratings_average = v;
        }
        if let Some(v) = patch.ratings_quantity {
            self.ratings_quantity = v;
        }
        if let Some(v) = patch.price {
            self.price = v;
        }
        if patch.price_discount.is_some() {
            self.price_discount = patch.price_discount;
        }
        if let Some(v) = patch.summary {
            self.summary = v.trim().to_string();
        }
        if let Some(v) = patch.description {
            self.description = Some(v.trim().to_string());
        }
        if let Some(v) = patch.image_cover {
            self.image_cover = v;
        }
        if let Some(v) = patch.images {
            self.images = v;
        }
        if let Some(v) = patch.start_dates {
            self.start_dates = v.iter().map(to_bson_date).collect();
        }
        if let Some(v) = patch.secret_tour {
            self.secret_tour = v;
        }
        if patch.start_location.is_some() {
            self.start_location = patch.start_location;
        }
        if let Some(v) = patch.locations {
            self.locations = v;
        }
        if let Some(v) = patch.guides {
            self.guides = parse_ids("guides", &v)?;
        }
        self.version += 1;

        self.validate()?;
        Ok(())
    }
}

fn to_bson_date(date: &ChronoDateTime<Utc>) -> DateTime {
    DateTime::from_millis(date.timestamp_millis())
}

fn parse_ids(path: &str, ids: &[String]) -> Result<Vec<ObjectId>, AppError> {
    ids.iter()
        .map(|id| {
            ObjectId::parse_str(id).map_err(|_| AppError::Cast {
                path: path.to_string(),
                value: id.clone(),
            })
        })
        .collect()
}

/// Lowercased, hyphen-separated form of a tour name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if c == '\'' || c == '\u{2019}' {
            continue;
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Restricts a tour filter to non-secret tours.
pub fn visible(mut filter: Document) -> Document {
    let hidden = doc! { "secretTour": { "$ne": true } };
    if filter.contains_key("secretTour") {
        return doc! { "$and": [filter, hidden] };
    }
    filter.insert("secretTour", doc! { "$ne": true });
    filter
}

/// Prepends the non-secret match to an aggregation pipeline.
pub fn visible_pipeline(mut pipeline: Vec<Document>) -> Vec<Document> {
    pipeline.insert(0, doc! { "$match": { "secretTour": { "$ne": true } } });
    pipeline
}

/// JSON view of a tour document with `durationWeeks` added.
pub fn with_virtuals(mut json: Value) -> Value {
    if let Value::Object(map) = &mut json {
        if let Some(duration) = map.get("duration").and_then(Value::as_f64) {
            map.insert(
                "durationWeeks".to_string(),
                Value::from((duration / 7.0).floor() as i64),
            );
        }
    }
    json
}

pub fn present(tour: &Tour) -> Result<Value, AppError> {
    Ok(with_virtuals(document::present(tour)?))
}

pub fn stats_pipeline() -> Vec<Document> {
    visible_pipeline(vec![
        doc! { "$match": { "ratingsAverage": { "$gte": 4.5 } } },
        doc! {
            "$group": {
                "_id": "$difficulty",
                "numTours": { "$sum": 1 },
                "numRatings": { "$sum": "$ratingsQuantity" },
                "avgRating": { "$avg": "$ratingsAverage" },
                "avgPrice": { "$avg": "$price" },
                "minPrice": { "$min": "$price" },
                "maxPrice": { "$max": "$price" },
            }
        },
        doc! { "$sort": { "avgPrice": 1 } },
    ])
}

/// Tour starts per month of `year`, busiest month first.
pub fn monthly_plan_pipeline(year: i32) -> Result<Vec<Document>, AppError> {
    let bound = |y: i32| {
        chrono::NaiveDate::from_ymd_opt(y, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Bson::DateTime(DateTime::from_millis(dt.and_utc().timestamp_millis())))
            .ok_or_else(|| AppError::Cast {
                path: "year".to_string(),
                value: year.to_string(),
            })
    };
    let start = bound(year)?;
    let end = bound(year + 1)?;

    Ok(visible_pipeline(vec![
        doc! { "$unwind": "$startDates" },
        doc! { "$match": { "startDates": { "$gte": start, "$lt": end } } },
        doc! {
            "$group": {
                "_id": { "$month": "$startDates" },
                "numTourStarts": { "$sum": 1 },
                "tours": { "$push": "$name" },
            }
        },
        doc! { "$addFields": { "month": "$_id" } },
        doc! { "$project": { "_id": 0 } },
        doc! { "$sort": { "numTourStarts": -1 } },
        doc! { "$limit": 12 },
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto() -> CreateTourDto {
        serde_json::from_value(serde_json::json!({
            "name": "  The Forest Hiker ",
            "duration": 5,
            "maxGroupSize": 25,
            "difficulty": "easy",
            "price": 397,
            "summary": "Breathtaking hike through the Canadian Banff National Park",
            "imageCover": "tour-1-cover.jpg",
            "startDates": ["2021-04-25T09:00:00Z", "2021-07-20T09:00:00Z"],
            "startLocation": { "coordinates": [-115.570154, 51.178456], "address": "224 Banff Ave" }
        }))
        .unwrap()
    }

    #[test]
    fn slug_is_lowercase_and_hyphenated() {
        assert_eq!(slugify("The Forest Hiker"), "the-forest-hiker");
        assert_eq!(slugify("  The Sea Explorer's  Tour! "), "the-sea-explorers-tour");
        assert_eq!(slugify("Test Tour 2"), "test-tour-2");
    }

    #[test]
    fn create_applies_defaults_and_derives_slug() {
        let tour = Tour::from_dto(dto()).unwrap();
        assert_eq!(tour.name, "The Forest Hiker");
        assert_eq!(tour.slug, "the-forest-hiker");
        assert_eq!(tour.ratings_average, 4.5);
        assert_eq!(tour.ratings_quantity, 0);
        assert!(!tour.secret_tour);
        assert_eq!(tour.start_dates.len(), 2);
        assert_eq!(tour.start_location.as_ref().unwrap().kind, "Point");
    }

    #[test]
    fn discount_must_be_below_price() {
        let mut bad = dto();
        bad.price_discount = Some(500.0);
        let err = Tour::from_dto(bad).unwrap_err();
        assert!(err
            .to_string()
            .contains("Discount price (500) must be less than actual price"));

        let mut tour = Tour::from_dto(dto()).unwrap();
        let err = tour
            .apply(UpdateTourDto {
                price: Some(100.0),
                price_discount: Some(150.0),
                ..UpdateTourDto::default()
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(..)));
    }

    #[test]
    fn short_names_and_bad_ratings_are_rejected() {
        let mut bad = dto();
        bad.name = "Short".into();
        bad.ratings_average = Some(6.0);
        let err = Tour::from_dto(bad).unwrap_err().to_string();
        assert!(err.contains("A tour name must have between 10 and 40 characters"));
        assert!(err.contains("Rating must be between 1 and 5"));
    }

    #[test]
    fn bad_guide_ids_are_cast_errors() {
        let mut bad = dto();
        bad.guides = vec!["not-an-id".into()];
        let err = Tour::from_dto(bad).unwrap_err();
        assert_eq!(err.to_string(), "Invalid guides: not-an-id.");
    }

    #[test]
    fn renaming_rederives_the_slug() {
        let mut tour = Tour::from_dto(dto()).unwrap();
        tour.apply(UpdateTourDto {
            name: Some("The Snow Adventurer".into()),
            ..UpdateTourDto::default()
        })
        .unwrap();
        assert_eq!(tour.slug, "the-snow-adventurer");
        assert_eq!(tour.version, 1);
    }

    #[test]
    fn secret_tours_are_always_filtered() {
        assert_eq!(
            visible(doc! { "difficulty": "easy" }),
            doc! { "difficulty": "easy", "secretTour": { "$ne": true } }
        );

        let asked = visible(doc! { "secretTour": true });
        assert_eq!(
            asked,
            doc! { "$and": [{ "secretTour": true }, { "secretTour": { "$ne": true } }] }
        );

        let pipeline = stats_pipeline();
        assert_eq!(
            pipeline[0],
            doc! { "$match": { "secretTour": { "$ne": true } } }
        );
    }

    #[test]
    fn duration_weeks_is_added_to_output() {
        let json = present(&Tour::from_dto(dto()).unwrap()).unwrap();
        assert_eq!(json["durationWeeks"], 0);
        assert_eq!(json["slug"], "the-forest-hiker");
        assert!(json.get("_id").is_none());

        let json = with_virtuals(serde_json::json!({ "duration": 14 }));
        assert_eq!(json["durationWeeks"], 2);
    }

    #[test]
    fn monthly_plan_spans_one_year() {
        let pipeline = monthly_plan_pipeline(2021).unwrap();
        let range = pipeline[2]
            .get_document("$match")
            .unwrap()
            .get_document("startDates")
            .unwrap();
        assert_eq!(
            range.get_datetime("$gte").unwrap().timestamp_millis(),
            1_609_459_200_000
        );
        assert_eq!(
            range.get_datetime("$lt").unwrap().timestamp_millis(),
            1_640_995_200_000
        );
    }
}
