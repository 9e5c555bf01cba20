//! Catalog row types as stored in the relational tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ContentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Movie,
    Series,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Movie => "movie",
            ContentType::Series => "series",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movie" => Ok(ContentType::Movie),
            "series" => Ok(ContentType::Series),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

/// A movie or series in the storefront catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: ContentId,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    pub content_type: ContentType,
    #[serde(default)]
    pub release_year: Option<i32>,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
    /// Age rating, e.g. "PG-13".
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub trailer_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub imdb_rating: Option<f64>,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub is_trending: bool,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub genres: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: i64,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Row of the standalone `movies` table used by the featured section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub is_premium: Option<bool>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MovieGenreRow {
    pub movie_id: String,
    pub genre: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MovieRatingRow {
    pub movie_id: String,
    pub rating: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rating {
    /// Mean of all ratings rounded to one decimal, 0 when unrated.
    pub average: f64,
    pub count: usize,
}

impl Rating {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Rating::default();
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        Rating {
            average: (mean * 10.0).round() / 10.0,
            count: scores.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeaturedMovie {
    pub movie: Movie,
    pub genres: Vec<String>,
    pub rating: Rating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogPostSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub slug: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}
