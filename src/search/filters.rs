//! Search filter form and the request/response bodies of `search-content`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{Content, ContentType};

/// Form value meaning "no restriction".
pub const ANY: &str = "all";

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "HD")]
    Hd,
    #[serde(rename = "4K")]
    UltraHd,
    #[serde(rename = "CAM")]
    Cam,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Hd => "HD",
            Quality::UltraHd => "4K",
            Quality::Cam => "CAM",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HD" => Ok(Quality::Hd),
            "4K" => Ok(Quality::UltraHd),
            "CAM" => Ok(Quality::Cam),
            other => Err(format!("unknown quality '{}'", other)),
        }
    }
}

/// Filters as sent to the search function. Absent fields are left out of the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

/// Filter inputs as typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchForm {
    pub content_type: String,
    pub release_year: String,
    pub min_rating: String,
    pub quality: String,
}

impl Default for SearchForm {
    fn default() -> Self {
        Self {
            content_type: ANY.to_string(),
            release_year: String::new(),
            min_rating: String::new(),
            quality: ANY.to_string(),
        }
    }
}

fn chosen(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty() && value != ANY).then_some(value)
}

impl SearchForm {
    /// Sets one field by name. Returns false for an unknown field.
    pub fn set(&mut self, field: &str, value: &str) -> bool {
        let slot = match field {
            "type" | "content_type" => &mut self.content_type,
            "year" | "release_year" => &mut self.release_year,
            "rating" | "min_rating" => &mut self.min_rating,
            "quality" => &mut self.quality,
            _ => return false,
        };
        *slot = value.to_string();
        true
    }

    pub fn reset(&mut self) {
        *self = SearchForm::default();
    }

    /// "all", empty and unparseable inputs are dropped.
    pub fn to_filters(&self) -> SearchFilters {
        SearchFilters {
            content_type: chosen(&self.content_type).and_then(|v| v.parse().ok()),
            release_year: chosen(&self.release_year).and_then(|v| v.parse().ok()),
            min_rating: chosen(&self.min_rating)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|r| r.is_finite()),
            quality: chosen(&self.quality).and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub filters: &'a SearchFilters,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<Content>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    pub data: Option<SearchPage>,
}
