//! Canonical record model shared by the normalizer, the reconciler and the stores.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// One logical category of data exported by Tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Group,
    Ledger,
    CostCentre,
    StockItem,
    Voucher,
}

impl EntityKind {
    /// Every kind in sync order: masters first, vouchers last.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Company,
        EntityKind::Group,
        EntityKind::Ledger,
        EntityKind::CostCentre,
        EntityKind::StockItem,
        EntityKind::Voucher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Group => "group",
            EntityKind::Ledger => "ledger",
            EntityKind::CostCentre => "cost_centre",
            EntityKind::StockItem => "stock_item",
            EntityKind::Voucher => "voucher",
        }
    }

    /// XML element carrying one entity in a Tally response.
    pub fn element_tag(&self) -> &'static str {
        match self {
            EntityKind::Company => "COMPANY",
            EntityKind::Group => "GROUP",
            EntityKind::Ledger => "LEDGER",
            EntityKind::CostCentre => "COSTCENTRE",
            EntityKind::StockItem => "STOCKITEM",
            EntityKind::Voucher => "VOUCHER",
        }
    }

    /// TDL object type used in collection definitions.
    pub fn tdl_type(&self) -> &'static str {
        match self {
            EntityKind::Company => "Company",
            EntityKind::Group => "Group",
            EntityKind::Ledger => "Ledger",
            EntityKind::CostCentre => "CostCentre",
            EntityKind::StockItem => "StockItem",
            EntityKind::Voucher => "Voucher",
        }
    }

    /// Request identity sent in the envelope header.
    pub fn request_id(&self) -> &'static str {
        match self {
            EntityKind::Company => "List of Companies",
            EntityKind::Group => "List of Groups",
            EntityKind::Ledger => "List of Ledgers",
            EntityKind::CostCentre => "List of Cost Centres",
            EntityKind::StockItem => "List of Stock Items",
            EntityKind::Voucher => "Day Book",
        }
    }

    /// Fields requested with FETCH for collection exports.
    pub fn default_fetch(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Company => &[
                "NAME",
                "GUID",
                "STARTINGFROM",
                "BOOKSFROM",
                "BASICCOMPANYFORMALNAME",
                "ALTERID",
            ],
            EntityKind::Group => &["NAME", "PARENT", "ISREVENUE", "AFFECTSGROSSPROFIT", "GUID", "ALTERID"],
            EntityKind::Ledger => &[
                "NAME",
                "PARENT",
                "OPENINGBALANCE",
                "CLOSINGBALANCE",
                "PARTYGSTIN",
                "LEDGERPHONE",
                "EMAIL",
                "GUID",
                "ALTERID",
            ],
            EntityKind::CostCentre => &["NAME", "PARENT", "CATEGORY", "GUID", "ALTERID"],
            EntityKind::StockItem => &[
                "NAME",
                "PARENT",
                "BASEUNITS",
                "OPENINGBALANCE",
                "OPENINGVALUE",
                "CLOSINGBALANCE",
                "CLOSINGVALUE",
                "GUID",
                "ALTERID",
            ],
            EntityKind::Voucher => &[],
        }
    }

    /// Whether the kind needs an open company (`SVCURRENTCOMPANY`).
    pub fn is_company_scoped(&self) -> bool {
        !matches!(self, EntityKind::Company)
    }

    pub fn sync_order(&self) -> usize {
        EntityKind::ALL
            .iter()
            .position(|k| k == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized || (normalized == "cost_center" && *k == EntityKind::CostCentre))
            .ok_or_else(|| AppError::ConfigurationError(format!("unknown entity kind '{}'", s)))
    }
}

/// Fiscal year identified by the calendar year it starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiscalYear(pub i32);

impl FiscalYear {
    /// The fiscal year containing `date` when years start on `start_month`.
    pub fn containing(date: NaiveDate, start_month: u32) -> Self {
        if date.month() >= start_month {
            FiscalYear(date.year())
        } else {
            FiscalYear(date.year() - 1)
        }
    }

    pub fn start_year(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for FiscalYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.0, (self.0 + 1).rem_euclid(100))
    }
}

impl FromStr for FiscalYear {
    type Err = AppError;

    /// Accepts the display form (`2024-25`) or a bare start year.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let start = s.trim().split('-').next().unwrap_or_default();
        start
            .parse::<i32>()
            .map(FiscalYear)
            .map_err(|_| AppError::Generic(format!("invalid fiscal year '{}'", s)))
    }
}

impl Serialize for FiscalYear {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Natural key plus owning scope: what makes two records "the same".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IdentityKey {
    pub kind: EntityKind,
    pub company: String,
    pub fiscal_year: FiscalYear,
    pub natural_key: String,
}

impl IdentityKey {
    pub fn new(
        kind: EntityKind,
        company: impl Into<String>,
        fiscal_year: FiscalYear,
        natural_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            company: company.into(),
            fiscal_year,
            natural_key: natural_key.into(),
        }
    }

    /// False when the mandatory identity field was missing from the source.
    pub fn is_complete(&self) -> bool {
        !self.natural_key.trim().is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.kind, self.company, self.fiscal_year, self.natural_key
        )
    }
}

/// Typed value of a canonical field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    #[serde(serialize_with = "serialize_decimal")]
    Amount(Decimal),
    Date(NaiveDate),
    Flag(bool),
    Number(i64),
}

fn serialize_decimal<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&value.normalize())
}

/// A share of a ledger entry booked against one cost centre.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAllocation {
    pub ledger_name: String,
    pub category: Option<String>,
    pub cost_centre: String,
    #[serde(serialize_with = "serialize_decimal")]
    pub amount: Decimal,
}

/// One accounting line of a voucher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub ledger_name: String,
    /// Signed amount: negative for debit, positive for credit.
    #[serde(serialize_with = "serialize_decimal")]
    pub amount: Decimal,
    pub is_deemed_positive: Option<bool>,
    pub allocations: Vec<CostAllocation>,
}

/// Why a record was flagged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MalformedReason {
    MissingIdentity { field: String },
    Unbalanced {
        #[serde(serialize_with = "serialize_decimal")]
        difference: Decimal,
    },
    BadAmount { field: String, raw: String },
    BadDate { field: String, raw: String },
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingIdentity { field } => {
                write!(f, "missing identity field {}", field)
            }
            MalformedReason::Unbalanced { difference } => {
                write!(f, "ledger entries do not balance (off by {})", difference)
            }
            MalformedReason::BadAmount { field, raw } => {
                write!(f, "unparseable amount in {}: '{}'", field, raw)
            }
            MalformedReason::BadDate { field, raw } => {
                write!(f, "unparseable date in {}: '{}'", field, raw)
            }
        }
    }
}

/// Provenance of a record. Never part of identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceBatch {
    pub batch_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Tally's ALTERID, bumped on every edit of the object.
    pub alter_id: Option<i64>,
}

impl SourceBatch {
    pub fn new(batch_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            fetched_at,
            alter_id: None,
        }
    }

    /// True when this provenance is strictly newer than `other`.
    pub fn is_newer_than(&self, fetched_at: DateTime<Utc>, alter_id: Option<i64>) -> bool {
        match (self.alter_id, alter_id) {
            (Some(mine), Some(theirs)) if mine != theirs => mine > theirs,
            _ => self.fetched_at > fetched_at,
        }
    }
}

/// Normalized, typed representation of one Tally object.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub kind: EntityKind,
    pub identity: IdentityKey,
    pub fields: BTreeMap<String, FieldValue>,
    /// Voucher ledger lines, in source order. Empty for masters.
    pub entries: Vec<LedgerEntry>,
    pub source: SourceBatch,
    pub malformed: Vec<MalformedReason>,
    /// Source XML, kept only for malformed records.
    pub raw: Option<String>,
}

impl CanonicalRecord {
    pub fn new(identity: IdentityKey, source: SourceBatch) -> Self {
        Self {
            kind: identity.kind,
            identity,
            fields: BTreeMap::new(),
            entries: Vec::new(),
            source,
            malformed: Vec::new(),
            raw: None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        !self.malformed.is_empty()
    }

    /// Records without identity cannot be persisted.
    pub fn is_persistable(&self) -> bool {
        self.identity.is_complete()
    }

    pub fn flag(&mut self, reason: MalformedReason) {
        self.malformed.push(reason);
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn amount(&self, name: &str) -> Option<Decimal> {
        match self.fields.get(name) {
            Some(FieldValue::Amount(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        match self.fields.get(name) {
            Some(FieldValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    /// Signed sum of the ledger entries.
    pub fn entry_total(&self) -> Decimal {
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Every cost allocation of every entry, flattened in source order.
    pub fn cost_allocations(&self) -> impl Iterator<Item = &CostAllocation> {
        self.entries.iter().flat_map(|e| e.allocations.iter())
    }

    /// Document body persisted by stores.
    pub fn document(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert(
            "fields".to_string(),
            serde_json::to_value(&self.fields).unwrap_or(serde_json::Value::Null),
        );
        if !self.entries.is_empty() {
            doc.insert(
                "entries".to_string(),
                serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Null),
            );
        }
        if self.is_malformed() {
            doc.insert(
                "malformed".to_string(),
                serde_json::to_value(&self.malformed).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(doc)
    }

    /// SHA-256 of the document body, used to skip rewrites of unchanged data.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
