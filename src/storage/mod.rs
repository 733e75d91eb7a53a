mod entries;
mod feeds;
mod filter_rules;
mod schema;
mod types;
mod unit_of_work;

pub use entries::EntryCounts;
pub use schema::Database;
pub use types::{
    DatabaseError, Entry, Feed, FetchInfoUpdate, FilterRule, MatchType, NewFeed, NewFilterRule,
    RuleType,
};
pub use unit_of_work::UnitOfWork;
