//! Read-only lookups against the built index

mod address;
mod filter;

pub use address::{AddressQuery, MAX_PAGE_SIZE};
pub use filter::{filter_clauses, with_filter};
