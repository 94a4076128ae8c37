//! Query-string driven list queries.
//!
//! `ApiFeatures` turns the raw key/value pairs of a request's query string into
//! a [`ListQuery`]: a filter document, a sort, a projection and an optional
//! skip/limit window. Each step consumes the builder and hands it back, so a
//! handler reads as `ApiFeatures::new(..).filter()?.sort().limit_fields().paginate()`.
//! Nothing here touches the database.

use std::collections::HashMap;

use chrono::{DateTime as ChronoDateTime, NaiveDate, Utc};
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, DateTime, Document},
    options::FindOptions,
};

use crate::error::AppError;

/// Keys that steer the query instead of filtering documents.
pub const CONTROL_KEYS: [&str; 4] = ["page", "sort", "limit", "fields"];

/// Bracketed keywords rewritten to comparison operators.
const OPERATORS: [&str; 4] = ["gt", "gte", "lt", "lte"];

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_LIMIT: i64 = 3;

/// How a filter value from the query string is cast before it reaches the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    Boolean,
    Date,
    Id,
    Text,
}

/// Known fields of a collection and their kinds. Unknown fields are passed
/// through as strings.
pub type Schema = &'static [(&'static str, FieldKind)];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filter: Document,
    pub sort: Document,
    pub projection: Document,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl ListQuery {
    pub fn find_options(&self) -> FindOptions {
        FindOptions::builder()
            .sort(self.sort.clone())
            .projection(self.projection.clone())
            .skip(self.skip)
            .limit(self.limit)
            .build()
    }
}

pub struct ApiFeatures<'q> {
    params: &'q HashMap<String, String>,
    schema: Schema,
    query: ListQuery,
}

impl<'q> ApiFeatures<'q> {
    /// Starts from `base`, the conditions the caller always wants (e.g. a parent id).
    pub fn new(base: Document, params: &'q HashMap<String, String>, schema: Schema) -> Self {
        ApiFeatures {
            params,
            schema,
            query: ListQuery {
                filter: base,
                ..ListQuery::default()
            },
        }
    }

    /// Adds every non-control key as an equality or comparison condition.
    ///
    /// `duration[gte]=5` becomes `{ duration: { $gte: 5 } }`; several bracketed
    /// keys on the same field merge into one sub-document. Brackets holding
    /// anything other than `gt`, `gte`, `lt` or `lte` are kept verbatim.
    pub fn filter(mut self) -> Result<Self, AppError> {
        let params = self.params;
        let mut keys: Vec<&String> = params
            .keys()
            .filter(|key| !CONTROL_KEYS.contains(&key.as_str()))
            .collect();
        keys.sort();

        for key in keys {
            let raw = &params[key];
            match split_bracket(key) {
                Some((field, keyword)) => {
                    let value = cast(self.schema, field, raw)?;
                    let operator = if OPERATORS.contains(&keyword) {
                        format!("${}", keyword)
                    } else {
                        keyword.to_string()
                    };

                    if let Some(Bson::Document(existing)) = self.query.filter.get_mut(field) {
                        existing.insert(operator, value);
                        continue;
                    }

                    // `duration=5&duration[gte]=3` keeps both conditions.
                    let mut condition = Document::new();
                    if let Some(equal) = self.query.filter.get(field) {
                        condition.insert("$eq", equal.clone());
                    }
                    condition.insert(operator, value);
                    self.query.filter.insert(field, condition);
                }
                None => {
                    let value = cast(self.schema, key, raw)?;
                    self.query.filter.insert(key.as_str(), value);
                }
            }
        }

        Ok(self)
    }

    /// `sort=-price,name` sorts by price descending, then name ascending.
    /// Newest first when absent.
    pub fn sort(mut self) -> Self {
        let sort = self
            .params
            .get("sort")
            .map(|value| signed_fields(value, -1, 1))
            .filter(|sort| !sort.is_empty());

        self.query.sort = sort.unwrap_or_else(|| doc! { "createdAt": -1 });
        self
    }

    /// `fields=name,price` projects only those fields; `-field` excludes one.
    /// Everything but `__v` when absent.
    pub fn limit_fields(mut self) -> Self {
        let projection = self
            .params
            .get("fields")
            .map(|value| signed_fields(value, 0, 1))
            .filter(|projection| !projection.is_empty());

        self.query.projection = projection.unwrap_or_else(|| doc! { "__v": 0 });
        self
    }

    /// Applies a skip/limit window, but only when `page` is present.
    pub fn paginate(mut self) -> Self {
        if let Some(page) = self.params.get("page") {
            let page = positive(Some(page)).unwrap_or(DEFAULT_PAGE);
            let limit = positive(self.params.get("limit")).unwrap_or(DEFAULT_LIMIT);

            // Both factors are positive, so the saturated product is too.
            self.query.skip = Some((page - 1).saturating_mul(limit) as u64);
            self.query.limit = Some(limit);
        }
        self
    }

    /// Keeps `fields` out of the projection whatever the caller asked for.
    ///
    /// An inclusive projection left with nothing to include would read as
    /// "every field", so it falls back to the default exclusion.
    pub fn hide(mut self, fields: &[&str]) -> Self {
        if is_inclusive(&self.query.projection) {
            for field in fields {
                self.query.projection.remove(*field);
            }
            if is_inclusive(&self.query.projection) {
                return self;
            }
            self.query.projection = doc! { "__v": 0 };
        }

        for field in fields {
            self.query.projection.insert(*field, 0);
        }
        self
    }

    pub fn build(self) -> ListQuery {
        self.query
    }
}

fn is_inclusive(projection: &Document) -> bool {
    projection
        .iter()
        .any(|(_, value)| matches!(value, Bson::Int32(1)))
}

/// `duration[gte]` -> `("duration", "gte")`.
fn split_bracket(key: &str) -> Option<(&str, &str)> {
    let open = key.find('[')?;
    let inner = key[open + 1..].strip_suffix(']')?;
    if open == 0 || inner.is_empty() || inner.contains('[') {
        return None;
    }
    Some((&key[..open], inner))
}

/// Comma-separated field list into an ordered document; a leading `-` picks `negative`.
fn signed_fields(value: &str, negative: i32, positive: i32) -> Document {
    let mut fields = Document::new();
    for field in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        match field.strip_prefix('-') {
            Some(name) if !name.is_empty() => {
                fields.insert(name, negative);
            }
            Some(_) => {}
            None => {
                fields.insert(field, positive);
            }
        }
    }
    fields
}

fn positive(value: Option<&String>) -> Option<i64> {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
}

fn cast(schema: Schema, field: &str, raw: &str) -> Result<Bson, AppError> {
    let kind = schema
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, kind)| *kind)
        .unwrap_or(FieldKind::Text);

    let invalid = || AppError::Cast {
        path: field.to_string(),
        value: raw.to_string(),
    };
    let trimmed = raw.trim();

    match kind {
        FieldKind::Text => Ok(Bson::String(raw.to_string())),
        FieldKind::Number => {
            if let Ok(n) = trimmed.parse::<i64>() {
                Ok(Bson::Int64(n))
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(Bson::Double)
                    .ok_or_else(invalid)
            }
        }
        FieldKind::Boolean => match trimmed {
            "true" => Ok(Bson::Boolean(true)),
            "false" => Ok(Bson::Boolean(false)),
            _ => Err(invalid()),
        },
        FieldKind::Date => parse_date(trimmed)
            .map(|millis| Bson::DateTime(DateTime::from_millis(millis)))
            .ok_or_else(invalid),
        FieldKind::Id => ObjectId::parse_str(trimmed)
            .map(Bson::ObjectId)
            .map_err(|_| invalid()),
    }
}

fn parse_date(value: &str) -> Option<i64> {
    if let Ok(dt) = ChronoDateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}
