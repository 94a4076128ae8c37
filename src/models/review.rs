use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::api_features::{FieldKind, Schema};

pub const COLLECTION: &str = "reviews";

pub const FIELDS: Schema = &[
    ("_id", FieldKind::Id),
    ("review", FieldKind::Text),
    ("rating", FieldKind::Number),
    ("createdAt", FieldKind::Date),
    ("user", FieldKind::Id),
    ("tour", FieldKind::Id),
];

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub review: String,
    pub rating: f64,
    pub created_at: DateTime,
    pub user: ObjectId,
    pub tour: ObjectId,
    #[serde(rename = "__v", default)]
    pub version: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReviewDto {
    #[validate(length(min = 1, message = "Review can not be empty"))]
    pub review: String,
    #[validate(range(min = 1.0, max = 5.0, message = "Rating must be between 1 and 5"))]
    pub rating: f64,
    /// Only read when the review is not posted under a tour path.
    pub tour: Option<String>,
}

impl Review {
    pub fn new(dto: CreateReviewDto, user: ObjectId, tour: ObjectId) -> Self {
        Review {
            id: None,
            review: dto.review.trim().to_string(),
            rating: dto.rating,
            created_at: DateTime::now(),
            user,
            tour,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(review: &str, rating: f64) -> CreateReviewDto {
        CreateReviewDto {
            review: review.into(),
            rating,
            tour: None,
        }
    }

    #[test]
    fn rating_must_be_within_range() {
        assert!(dto("Loved it", 5.0).validate().is_ok());
        assert!(dto("Meh", 0.5).validate().is_err());
        assert!(dto("Wow", 5.5).validate().is_err());
    }

    #[test]
    fn review_text_is_required() {
        let err = dto("", 4.0).validate().unwrap_err();
        assert!(err.field_errors().contains_key("review"));
    }

    #[test]
    fn new_review_references_author_and_tour() {
        let (user, tour) = (ObjectId::new(), ObjectId::new());
        let review = Review::new(dto("  Great guide  ", 4.0), user, tour);
        assert_eq!(review.review, "Great guide");
        assert_eq!(review.user, user);
        assert_eq!(review.tour, tour);
        assert!(review.id.is_none());
    }
}
