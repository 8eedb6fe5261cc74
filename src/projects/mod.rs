pub mod file_repository;
pub mod repository;

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title given to games created without one. A game still carrying this
/// title is considered unnamed and gets a generated title on its next run.
pub const UNTITLED: &str = "Untitled Game";

/// File name of the generated cover image inside a game folder.
pub const COVER_IMAGE_FILE: &str = "card.png";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub slug: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub preview_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Project {
    pub fn is_untitled(&self) -> bool {
        self.title.trim().is_empty() || self.title == UNTITLED
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProjectError {
    #[error("game not found: {0}")]
    NotFound(String),

    #[error("invalid game metadata for {slug}: {reason}")]
    Metadata { slug: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Lowercase, collapse every run of non-alphanumerics into `-`, trim dashes.
pub fn slugify_title(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "game".to_string()
    } else {
        slug
    }
}

/// Slugs double as folder names, so only accept what `slugify_title` can produce.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
