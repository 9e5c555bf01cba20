//! Storefront catalog: content rows, browsing, featured movies and the blog teaser.

mod models;
mod service;

pub use models::{
    BlogPostSummary, Content, ContentId, ContentType, FeaturedMovie, Genre, Movie, Rating,
};
pub use service::{
    BrowsePage, BrowseRequest, BrowseSort, CatalogError, CatalogService, HomeRows,
    CONTENT_TABLE, DEFAULT_BROWSE_PAGE_SIZE,
};
