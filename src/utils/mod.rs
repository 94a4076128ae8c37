pub mod api_features;
pub mod document;
pub mod email;
