//! Response parser and normalizer.
//!
//! Raw Tally XML goes in, [`CanonicalRecord`]s come out. Parsing is pure:
//! no I/O, no shared state, nothing that suspends.
//!
//! - [`tree`] turns an element subtree into a generic JSON value
//! - [`shape`] is the single place where wrapper objects, singular-vs-list
//!   ambiguity and tag casing are resolved
//! - [`dates`] and [`amount`] normalize scalar encodings
//! - [`entities`] projects each entity kind into a canonical record
//! - [`stream`] yields records lazily from a whole response

pub mod amount;
pub mod dates;
pub mod entities;
pub mod shape;
pub mod stream;
pub mod tree;

pub use amount::{parse_amount, parse_quantity};
pub use dates::{parse_date, to_tally_date};
pub use stream::RecordStream;
pub use tree::parse_tree;

use crate::models::{EntityKind, FiscalYear, SourceBatch};

/// What the normalizer needs to know beyond the XML itself.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Owning company; Tally does not repeat it inside each object.
    pub company: String,
    /// Fiscal year assigned to masters, and to vouchers without a usable date.
    pub fiscal_year: FiscalYear,
    pub fiscal_year_start_month: u32,
    pub source: SourceBatch,
}

/// Lazily normalizes every `kind` entity found in `raw`.
///
/// ```
/// use chrono::Utc;
/// use tallysync_core::models::{EntityKind, FiscalYear, SourceBatch};
/// use tallysync_core::parse::{records, NormalizeContext};
/// use uuid::Uuid;
///
/// let raw = r#"<ENVELOPE><BODY><DATA><COLLECTION>
///   <GROUP NAME="Sundry Debtors"><PARENT>Current Assets</PARENT></GROUP>
/// </COLLECTION></DATA></BODY></ENVELOPE>"#;
/// let ctx = NormalizeContext {
///     company: "Acme".to_string(),
///     fiscal_year: FiscalYear(2024),
///     fiscal_year_start_month: 4,
///     source: SourceBatch::new(Uuid::new_v4(), Utc::now()),
/// };
/// let groups: Vec<_> = records(raw, EntityKind::Group, ctx).collect();
/// assert_eq!(groups.len(), 1);
/// ```
pub fn records(raw: &str, kind: EntityKind, ctx: NormalizeContext) -> RecordStream<'_> {
    RecordStream::new(raw, kind, ctx)
}
