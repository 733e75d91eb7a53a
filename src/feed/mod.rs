//! Fetching and normalizing feeds.
//!
//! - [`fetcher`] - conditional HTTP retrieval with retry and size limits
//! - [`decoder`] - RSS/Atom and JSON Feed decoders behind [`FeedDecoder`]
//! - [`parser`] - cleanup of decoded entries into [`EntryDraft`]s
//!
//! # Example
//!
//! ```no_run
//! use feedloom::config::Config;
//! use feedloom::feed::{EntryParser, Fetcher};
//! # async fn run(feed: feedloom::storage::Feed) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let fetcher = Fetcher::new(&config.fetcher)?;
//! let parser = EntryParser::new(&config.parser);
//!
//! let result = fetcher.fetch_feed(&feed).await;
//! let (drafts, dropped) = parser.normalize_batch(result.entries);
//! # let _ = (drafts, dropped);
//! # Ok(())
//! # }
//! ```

mod decoder;
mod fetcher;
mod parser;

pub use decoder::{
    decoder_for, sniff, DecodeError, DecodedFeed, FeedDecoder, FeedInfo, JsonFeedDecoder,
    SyndicationDecoder,
};
pub use fetcher::{FetchError, FetchResult, Fetcher};
pub use parser::{EntryDraft, EntryParseError, EntryParser, RawEntry};
