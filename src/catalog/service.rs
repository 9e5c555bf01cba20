//! Read-only catalog queries.
//!
//! Every section of the storefront is a plain table read. Sections fail
//! independently: an error in one row never takes the others down.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, DataBackend, Query};

use super::models::*;

pub const CONTENT_TABLE: &str = "content";
pub const GENRES_TABLE: &str = "genres";
pub const CONTENT_GENRES_TABLE: &str = "content_genres";
pub const MOVIES_TABLE: &str = "movies";
pub const MOVIE_GENRES_TABLE: &str = "movie_genres";
pub const MOVIE_RATINGS_TABLE: &str = "movie_ratings";
pub const BLOG_POSTS_TABLE: &str = "blog_posts";

pub const FEATURED_LIMIT: usize = 5;
pub const ROW_LIMIT: usize = 20;
pub const FEATURED_MOVIES_LIMIT: usize = 12;
pub const RECENT_POSTS_LIMIT: usize = 3;
pub const DEFAULT_BROWSE_PAGE_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowseSort {
    Newest,
    #[default]
    Popular,
    Rating,
}

impl BrowseSort {
    fn column(&self) -> &'static str {
        match self {
            BrowseSort::Newest => "created_at",
            BrowseSort::Popular => "view_count",
            BrowseSort::Rating => "imdb_rating",
        }
    }
}

impl fmt::Display for BrowseSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrowseSort::Newest => "newest",
            BrowseSort::Popular => "popular",
            BrowseSort::Rating => "rating",
        };
        f.write_str(name)
    }
}

impl FromStr for BrowseSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(BrowseSort::Newest),
            "popular" => Ok(BrowseSort::Popular),
            "rating" => Ok(BrowseSort::Rating),
            other => Err(format!("unknown sort '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowseRequest {
    pub content_type: Option<ContentType>,
    pub genre_slug: Option<String>,
    pub sort: BrowseSort,
    /// 1-based page number.
    pub page: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowsePage {
    pub items: Vec<Content>,
    pub total: u64,
    pub page: usize,
    pub total_pages: usize,
    /// Genre the page was restricted to, when it exists.
    pub genre: Option<Genre>,
}

/// One result per home row; a failed row does not hide the others.
#[derive(Debug, Clone, PartialEq)]
pub struct HomeRows {
    pub featured: Result<Vec<Content>, CatalogError>,
    pub trending: Result<Vec<Content>, CatalogError>,
    pub popular_movies: Result<Vec<Content>, CatalogError>,
    pub popular_series: Result<Vec<Content>, CatalogError>,
    pub recent: Result<Vec<Content>, CatalogError>,
}

pub struct CatalogService {
    data: Arc<dyn DataBackend>,
    browse_page_size: usize,
}

impl CatalogService {
    pub fn new(data: Arc<dyn DataBackend>, browse_page_size: usize) -> Self {
        Self {
            data,
            browse_page_size: browse_page_size.max(1),
        }
    }

    async fn contents(&self, query: Query) -> Result<Vec<Content>, CatalogError> {
        Ok(self.data.select(&query).await?.decode()?)
    }

    // =========================================================================
    // Home
    // =========================================================================

    pub async fn featured(&self) -> Result<Vec<Content>, CatalogError> {
        self.contents(
            Query::table(CONTENT_TABLE)
                .eq("is_featured", true)
                .order("view_count", false)
                .limit(FEATURED_LIMIT),
        )
        .await
    }

    pub async fn trending(&self) -> Result<Vec<Content>, CatalogError> {
        self.contents(
            Query::table(CONTENT_TABLE)
                .eq("is_trending", true)
                .order("view_count", false)
                .limit(ROW_LIMIT),
        )
        .await
    }

    pub async fn popular(&self, content_type: ContentType) -> Result<Vec<Content>, CatalogError> {
        self.contents(
            Query::table(CONTENT_TABLE)
                .eq("content_type", content_type)
                .order("view_count", false)
                .limit(ROW_LIMIT),
        )
        .await
    }

    pub async fn recent(&self) -> Result<Vec<Content>, CatalogError> {
        self.contents(
            Query::table(CONTENT_TABLE)
                .order("created_at", false)
                .limit(ROW_LIMIT),
        )
        .await
    }

    /// Loads all home rows concurrently.
    pub async fn home_rows(&self) -> HomeRows {
        let (featured, trending, popular_movies, popular_series, recent) = tokio::join!(
            self.featured(),
            self.trending(),
            self.popular(ContentType::Movie),
            self.popular(ContentType::Series),
            self.recent(),
        );
        for (name, row) in [
            ("featured", &featured),
            ("trending", &trending),
            ("popular movies", &popular_movies),
            ("popular series", &popular_series),
            ("recent", &recent),
        ] {
            if let Err(e) = row {
                warn!("Failed to load {} row: {}", name, e);
            }
        }
        HomeRows {
            featured,
            trending,
            popular_movies,
            popular_series,
            recent,
        }
    }

    // =========================================================================
    // Browse
    // =========================================================================

    pub async fn genres(&self) -> Result<Vec<Genre>, CatalogError> {
        let query = Query::table(GENRES_TABLE).order("name", true);
        Ok(self.data.select(&query).await?.decode()?)
    }

    pub async fn genre_by_slug(&self, slug: &str) -> Result<Option<Genre>, CatalogError> {
        let query = Query::table(GENRES_TABLE).eq("slug", slug).limit(1);
        Ok(self.data.select(&query).await?.decode_first()?)
    }

    async fn content_ids_for_genre(&self, genre_id: i64) -> Result<Vec<ContentId>, CatalogError> {
        #[derive(serde::Deserialize)]
        struct ContentGenreRow {
            content_id: ContentId,
        }

        let query = Query::table(CONTENT_GENRES_TABLE)
            .select("content_id")
            .eq("genre_id", genre_id);
        let rows: Vec<ContentGenreRow> = self.data.select(&query).await?.decode()?;
        Ok(rows.into_iter().map(|row| row.content_id).collect())
    }

    /// One page of the catalog. An unknown genre slug browses everything.
    pub async fn browse(&self, request: &BrowseRequest) -> Result<BrowsePage, CatalogError> {
        let page = request.page.max(1);
        let from = (page - 1) * self.browse_page_size;
        let to = from + self.browse_page_size - 1;

        let mut query = Query::table(CONTENT_TABLE).with_count();
        if let Some(content_type) = request.content_type {
            query = query.eq("content_type", content_type);
        }

        let genre = match request.genre_slug.as_deref() {
            Some(slug) => self.genre_by_slug(slug).await?,
            None => None,
        };
        if let Some(genre) = &genre {
            let ids = self.content_ids_for_genre(genre.id).await?;
            if ids.is_empty() {
                debug!("Genre {} has no content", genre.slug);
                return Ok(BrowsePage {
                    items: Vec::new(),
                    total: 0,
                    page,
                    total_pages: 0,
                    genre: Some(genre.clone()),
                });
            }
            query = query.in_list("id", ids);
        }

        query = query.order(request.sort.column(), false).range(from, to);
        let result = self.data.select(&query).await?;
        let total = result.total.unwrap_or(result.rows.len() as u64);
        let items = result.decode()?;

        Ok(BrowsePage {
            items,
            total,
            page,
            total_pages: total.div_ceil(self.browse_page_size as u64) as usize,
            genre,
        })
    }

    pub async fn get_content(
        &self,
        content_type: ContentType,
        slug: &str,
    ) -> Result<Content, CatalogError> {
        let query = Query::table(CONTENT_TABLE)
            .eq("slug", slug)
            .eq("content_type", content_type)
            .limit(1);
        self.data
            .select(&query)
            .await?
            .decode_first()?
            .ok_or_else(|| CatalogError::NotFound(format!("{} '{}'", content_type, slug)))
    }

    pub async fn get_contents(&self, ids: &[ContentId]) -> Result<Vec<Content>, CatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.contents(Query::table(CONTENT_TABLE).in_list("id", ids.iter().copied()))
            .await
    }

    // =========================================================================
    // Featured movies and blog
    // =========================================================================

    /// Top movies by views, each with its genres and average user rating.
    pub async fn featured_movies(&self) -> Result<Vec<FeaturedMovie>, CatalogError> {
        let query = Query::table(MOVIES_TABLE)
            .order("view_count", false)
            .limit(FEATURED_MOVIES_LIMIT);
        let movies: Vec<Movie> = self.data.select(&query).await?.decode()?;
        if movies.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = movies.iter().map(|m| m.id.as_str()).collect();

        let genre_rows: Vec<MovieGenreRow> = self
            .side_rows(
                Query::table(MOVIE_GENRES_TABLE)
                    .select("movie_id,genre")
                    .in_list("movie_id", ids.iter()),
            )
            .await;
        let rating_rows: Vec<MovieRatingRow> = self
            .side_rows(
                Query::table(MOVIE_RATINGS_TABLE)
                    .select("movie_id,rating")
                    .in_list("movie_id", ids.iter()),
            )
            .await;

        let mut genres: HashMap<String, Vec<String>> = HashMap::new();
        for row in genre_rows {
            genres.entry(row.movie_id).or_default().push(row.genre);
        }
        let mut scores: HashMap<String, Vec<f64>> = HashMap::new();
        for row in rating_rows {
            scores.entry(row.movie_id).or_default().push(row.rating);
        }

        Ok(movies
            .into_iter()
            .map(|movie| {
                let genres = genres
                    .remove(&movie.id)
                    .unwrap_or_else(|| movie.category.iter().cloned().collect());
                let rating = Rating::from_scores(
                    scores.get(&movie.id).map(Vec::as_slice).unwrap_or_default(),
                );
                FeaturedMovie {
                    movie,
                    genres,
                    rating,
                }
            })
            .collect())
    }

    /// Auxiliary rows for a join; failures read as "no rows".
    async fn side_rows<T: serde::de::DeserializeOwned>(&self, query: Query) -> Vec<T> {
        let table = query.table_name().to_string();
        match self.data.select(&query).await.and_then(|r| r.decode()) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to load {}: {}", table, e);
                Vec::new()
            }
        }
    }

    /// Latest posts, or `None` when the section cannot be loaded.
    pub async fn recent_blog_posts(&self) -> Option<Vec<BlogPostSummary>> {
        let query = Query::table(BLOG_POSTS_TABLE)
            .select("id,title,excerpt,category,created_at,slug,thumbnail")
            .order("created_at", false)
            .limit(RECENT_POSTS_LIMIT);
        match self.data.select(&query).await.and_then(|r| r.decode()) {
            Ok(posts) => Some(posts),
            Err(e) => {
                warn!("Failed to load blog posts: {}", e);
                None
            }
        }
    }
}
