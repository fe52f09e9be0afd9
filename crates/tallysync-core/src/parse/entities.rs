//! Projection of entity subtrees into canonical records.

use rust_decimal::Decimal;
use serde_json::Value;

use super::amount::{parse_amount, parse_quantity};
use super::dates::parse_date;
use super::shape::{attr, flag, list, name_of, scalar};
use super::NormalizeContext;
use crate::models::{
    CanonicalRecord, CostAllocation, EntityKind, FieldValue, FiscalYear, IdentityKey,
    LedgerEntry, MalformedReason,
};

const LEDGER_ENTRY_LISTS: [&str; 2] = ["ALLLEDGERENTRIES.LIST", "LEDGERENTRIES.LIST"];
const INVENTORY_ENTRY_LISTS: [&str; 2] = ["ALLINVENTORYENTRIES.LIST", "INVENTORYENTRIES.LIST"];

/// Projects one entity subtree. Never fails: problems become flags.
pub fn project(kind: EntityKind, node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = match kind {
        EntityKind::Company => company(node, ctx),
        EntityKind::Group => group(node, ctx),
        EntityKind::Ledger => ledger(node, ctx),
        EntityKind::CostCentre => cost_centre(node, ctx),
        EntityKind::StockItem => stock_item(node, ctx),
        EntityKind::Voucher => voucher(node, ctx),
    };

    record.source.alter_id = scalar(node, "ALTERID").and_then(|s| s.parse().ok());
    set_text(&mut record, node, "GUID", "guid");
    record
}

fn master(kind: EntityKind, node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let name = name_of(node);
    let key = IdentityKey::new(
        kind,
        ctx.company.clone(),
        ctx.fiscal_year,
        name.clone().unwrap_or_default(),
    );
    let mut record = CanonicalRecord::new(key, ctx.source.clone());
    match name {
        Some(name) => record.set("name", FieldValue::Text(name)),
        None => record.flag(MalformedReason::MissingIdentity {
            field: "NAME".to_string(),
        }),
    }
    set_text(&mut record, node, "PARENT", "parent");
    record
}

fn company(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = master(EntityKind::Company, node, ctx);
    // A company is its own scope
    if let Some(name) = record.text("name").map(str::to_string) {
        record.identity.company = name;
    }
    set_date(&mut record, node, "STARTINGFROM", "starting_from");
    set_date(&mut record, node, "BOOKSFROM", "books_from");
    set_text(&mut record, node, "BASICCOMPANYFORMALNAME", "formal_name");
    if let Some(start) = record.date("starting_from") {
        record.identity.fiscal_year = FiscalYear::containing(start, ctx.fiscal_year_start_month);
    }
    record
}

fn group(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = master(EntityKind::Group, node, ctx);
    set_flag(&mut record, node, "ISREVENUE", "is_revenue");
    set_flag(&mut record, node, "AFFECTSGROSSPROFIT", "affects_gross_profit");
    record
}

fn ledger(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = master(EntityKind::Ledger, node, ctx);
    set_amount(&mut record, node, "OPENINGBALANCE", "opening_balance");
    set_amount(&mut record, node, "CLOSINGBALANCE", "closing_balance");
    set_text(&mut record, node, "PARTYGSTIN", "gstin");
    set_text(&mut record, node, "LEDGERPHONE", "phone");
    set_text(&mut record, node, "EMAIL", "email");
    record
}

fn cost_centre(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = master(EntityKind::CostCentre, node, ctx);
    set_text(&mut record, node, "CATEGORY", "category");
    record
}

fn stock_item(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let mut record = master(EntityKind::StockItem, node, ctx);
    set_text(&mut record, node, "BASEUNITS", "base_units");
    set_quantity(&mut record, node, "OPENINGBALANCE", "opening_quantity");
    set_quantity(&mut record, node, "CLOSINGBALANCE", "closing_quantity");
    set_amount(&mut record, node, "OPENINGVALUE", "opening_value");
    set_amount(&mut record, node, "CLOSINGVALUE", "closing_value");
    record
}

fn voucher(node: &Value, ctx: &NormalizeContext) -> CanonicalRecord {
    let number = scalar(node, "VOUCHERNUMBER");
    let voucher_type = scalar(node, "VOUCHERTYPENAME")
        .or_else(|| attr(node, "VCHTYPE").map(str::to_string))
        .unwrap_or_default();
    let date = scalar(node, "DATE");
    let parsed_date = date.as_deref().and_then(parse_date);

    let fiscal_year = parsed_date
        .map(|d| FiscalYear::containing(d, ctx.fiscal_year_start_month))
        .unwrap_or(ctx.fiscal_year);
    let natural_key = number
        .as_ref()
        .map(|n| format!("{}/{}", voucher_type, n))
        .unwrap_or_default();
    let key = IdentityKey::new(
        EntityKind::Voucher,
        ctx.company.clone(),
        fiscal_year,
        natural_key,
    );
    let mut record = CanonicalRecord::new(key, ctx.source.clone());

    match number {
        Some(n) => record.set("voucher_number", FieldValue::Text(n)),
        None => record.flag(MalformedReason::MissingIdentity {
            field: "VOUCHERNUMBER".to_string(),
        }),
    }
    if !voucher_type.is_empty() {
        record.set("voucher_type", FieldValue::Text(voucher_type));
    }
    match (parsed_date, date) {
        (Some(d), _) => record.set("date", FieldValue::Date(d)),
        (None, Some(raw)) => record.flag(MalformedReason::BadDate {
            field: "DATE".to_string(),
            raw,
        }),
        (None, None) => record.flag(MalformedReason::BadDate {
            field: "DATE".to_string(),
            raw: String::new(),
        }),
    }
    set_date(&mut record, node, "EFFECTIVEDATE", "effective_date");
    set_text(&mut record, node, "PARTYLEDGERNAME", "party");
    set_text(&mut record, node, "NARRATION", "narration");
    set_text(&mut record, node, "REFERENCE", "reference");
    set_flag(&mut record, node, "ISCANCELLED", "is_cancelled");
    set_flag(&mut record, node, "ISOPTIONAL", "is_optional");
    if let Some(master_id) = scalar(node, "MASTERID").and_then(|s| s.parse::<i64>().ok()) {
        record.set("master_id", FieldValue::Number(master_id));
    }

    let mut entries = Vec::new();
    for list_name in LEDGER_ENTRY_LISTS {
        for line in list(node, list_name) {
            entries.push(ledger_entry(line, &mut record));
        }
    }
    // Item invoices book the sales/purchase ledger inside each inventory line
    for list_name in INVENTORY_ENTRY_LISTS {
        for item in list(node, list_name) {
            for line in list(item, "ACCOUNTINGALLOCATIONS.LIST") {
                entries.push(ledger_entry(line, &mut record));
            }
        }
    }
    record.entries = entries;

    let total = record.entry_total();
    if !total.is_zero() {
        record.flag(MalformedReason::Unbalanced { difference: total });
    }
    record
}

fn ledger_entry(line: &Value, record: &mut CanonicalRecord) -> LedgerEntry {
    let ledger_name = scalar(line, "LEDGERNAME").unwrap_or_default();
    let amount = read_amount(line, "AMOUNT", record).unwrap_or(Decimal::ZERO);

    let mut allocations = Vec::new();
    for category in list(line, "CATEGORYALLOCATIONS.LIST") {
        let category_name = scalar(category, "CATEGORY");
        for centre in list(category, "COSTCENTREALLOCATIONS.LIST") {
            allocations.push(allocation(
                &ledger_name,
                category_name.clone(),
                centre,
                record,
            ));
        }
    }
    for centre in list(line, "COSTCENTREALLOCATIONS.LIST") {
        allocations.push(allocation(&ledger_name, None, centre, record));
    }

    LedgerEntry {
        ledger_name,
        amount,
        is_deemed_positive: flag(line, "ISDEEMEDPOSITIVE"),
        allocations,
    }
}

fn allocation(
    ledger_name: &str,
    category: Option<String>,
    centre: &Value,
    record: &mut CanonicalRecord,
) -> CostAllocation {
    CostAllocation {
        ledger_name: ledger_name.to_string(),
        category,
        cost_centre: name_of(centre)
            .or_else(|| scalar(centre, "COSTCENTRENAME"))
            .unwrap_or_default(),
        amount: read_amount(centre, "AMOUNT", record).unwrap_or(Decimal::ZERO),
    }
}

/// Reads an amount, flagging the record when the text is not a number.
/// Absent fields are `None` and not flagged.
fn read_amount(node: &Value, tag: &str, record: &mut CanonicalRecord) -> Option<Decimal> {
    let raw = scalar(node, tag)?;
    match parse_amount(&raw) {
        Some(value) => Some(value),
        None => {
            record.flag(MalformedReason::BadAmount {
                field: tag.to_string(),
                raw,
            });
            Some(Decimal::ZERO)
        }
    }
}

fn set_amount(record: &mut CanonicalRecord, node: &Value, tag: &str, name: &str) {
    if let Some(value) = read_amount(node, tag, record) {
        record.set(name, FieldValue::Amount(value));
    }
}

fn set_quantity(record: &mut CanonicalRecord, node: &Value, tag: &str, name: &str) {
    if let Some((value, unit)) = scalar(node, tag).as_deref().and_then(parse_quantity) {
        record.set(name, FieldValue::Amount(value));
        if let Some(unit) = unit {
            record
                .fields
                .entry("base_units".to_string())
                .or_insert(FieldValue::Text(unit));
        }
    }
}

fn set_text(record: &mut CanonicalRecord, node: &Value, tag: &str, name: &str) {
    if let Some(value) = scalar(node, tag) {
        record.set(name, FieldValue::Text(value));
    }
}

fn set_flag(record: &mut CanonicalRecord, node: &Value, tag: &str, name: &str) {
    if let Some(value) = flag(node, tag) {
        record.set(name, FieldValue::Flag(value));
    }
}

fn set_date(record: &mut CanonicalRecord, node: &Value, tag: &str, name: &str) {
    if let Some(raw) = scalar(node, tag) {
        match parse_date(&raw) {
            Some(date) => record.set(name, FieldValue::Date(date)),
            None => record.flag(MalformedReason::BadDate {
                field: tag.to_string(),
                raw,
            }),
        }
    }
}
