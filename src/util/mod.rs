//! Utility functions shared by the ingestion pipeline.
//!
//! - **Hashing**: normalized link/title/content digests used for deduplication
//! - **Text processing**: markup stripping, whitespace and length normalization
//! - **URL validation**: security-focused validation for feed subscriptions
//!
//! # Examples
//!
//! ```
//! use feedloom::util::{compute_link_hash, compute_title_hash, strip_markup};
//!
//! assert_eq!(
//!     compute_link_hash("https://example.com/post/"),
//!     compute_link_hash("HTTPS://EXAMPLE.COM/post?utm_source=rss"),
//! );
//! assert_eq!(compute_title_hash(" Hello  World "), compute_title_hash("hello world"));
//! assert_eq!(strip_markup("<p>Hello <b>world</b></p>"), "Hello world");
//! ```

mod hash;
mod text;
mod url_validator;

pub use hash::{
    compute_content_hash, compute_hashes, compute_link_hash, compute_title_hash, normalize_link,
    EntryHashes, CONTENT_FINGERPRINT_CHARS,
};
pub use text::{collapse_whitespace, strip_control_chars, strip_markup, truncate_chars, word_count};
pub use url_validator::{validate_url, UrlValidationError};
