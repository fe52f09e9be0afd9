//! Request envelopes for Tally's XML export interface.
//!
//! Masters are exported through an inline TDL collection; vouchers through
//! the built-in `Day Book` report over a date range.

use quick_xml::se::to_string_with_root;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tallysync_core::error::AppError;
use tallysync_core::models::EntityKind;
use tallysync_core::parse::to_tally_date;
use tallysync_core::source::TallyRequest;

/// Asks Tally to answer in XML rather than its default display format.
pub const EXPORT_FORMAT: &str = "$$SysName:XML";

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "HEADER")]
    header: Header<'a>,
    #[serde(rename = "BODY")]
    body: Body,
}

#[derive(Serialize)]
struct Header<'a> {
    #[serde(rename = "VERSION")]
    version: u8,
    #[serde(rename = "TALLYREQUEST")]
    tally_request: &'static str,
    #[serde(rename = "TYPE")]
    request_type: &'static str,
    #[serde(rename = "ID")]
    id: &'a str,
}

#[derive(Serialize)]
struct Body {
    #[serde(rename = "DESC")]
    desc: Desc,
}

#[derive(Serialize)]
struct Desc {
    #[serde(rename = "STATICVARIABLES")]
    static_variables: StaticVariables,
    #[serde(rename = "TDL", skip_serializing_if = "Option::is_none")]
    tdl: Option<Tdl>,
}

/// Static variables keep their insertion order on the wire.
struct StaticVariables(Vec<(String, String)>);

impl StaticVariables {
    fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_ascii_uppercase(), value)),
        }
    }
}

impl Serialize for StaticVariables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct Tdl {
    #[serde(rename = "TDLMESSAGE")]
    message: TdlMessage,
}

#[derive(Serialize)]
struct TdlMessage {
    #[serde(rename = "COLLECTION")]
    collection: Collection,
}

#[derive(Serialize)]
struct Collection {
    #[serde(rename = "@NAME")]
    name: String,
    #[serde(rename = "@ISMODIFY")]
    is_modify: &'static str,
    #[serde(rename = "TYPE")]
    object_type: &'static str,
    #[serde(rename = "FETCH")]
    fetch: String,
}

/// Serializes `request` into the envelope Tally expects.
///
/// ```
/// use tallysync_client::envelope::build_envelope;
/// use tallysync_core::models::EntityKind;
/// use tallysync_core::source::TallyRequest;
///
/// let xml = build_envelope(&TallyRequest::new(EntityKind::Ledger).company("Acme")).unwrap();
/// assert!(xml.starts_with("<ENVELOPE><HEADER><VERSION>1</VERSION>"));
/// assert!(xml.contains("<SVCURRENTCOMPANY>Acme</SVCURRENTCOMPANY>"));
/// ```
pub fn build_envelope(request: &TallyRequest) -> Result<String, AppError> {
    request.validate()?;

    let mut vars = StaticVariables(Vec::new());
    vars.set("SVEXPORTFORMAT", EXPORT_FORMAT);
    if let Some(company) = &request.company {
        vars.set("SVCURRENTCOMPANY", company.as_str());
    }

    let (request_type, tdl) = if request.kind == EntityKind::Voucher {
        if let (Some(from), Some(to)) = (request.from, request.to) {
            vars.set("SVFROMDATE", to_tally_date(from));
            vars.set("SVTODATE", to_tally_date(to));
        }
        vars.set("EXPLODEFLAG", "Yes");
        ("Data", None)
    } else {
        let collection = Collection {
            name: request.kind.request_id().to_string(),
            is_modify: "No",
            object_type: request.kind.tdl_type(),
            fetch: request.fetch_list().join(", "),
        };
        ("Collection", Some(Tdl {
            message: TdlMessage { collection },
        }))
    };
    for (name, value) in &request.static_vars {
        vars.set(name, value.as_str());
    }

    let envelope = Envelope {
        header: Header {
            version: 1,
            tally_request: "Export",
            request_type,
            id: request.kind.request_id(),
        },
        body: Body {
            desc: Desc {
                static_variables: vars,
                tdl,
            },
        },
    };

    to_string_with_root("ENVELOPE", &envelope)
        .map_err(|e| AppError::Generic(format!("cannot serialize request envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_master_collection_envelope() {
        let xml = build_envelope(&TallyRequest::new(EntityKind::Group).company("Acme & Co")).unwrap();
        assert!(xml.contains("<TALLYREQUEST>Export</TALLYREQUEST><TYPE>Collection</TYPE><ID>List of Groups</ID>"));
        assert!(xml.contains("<SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>"));
        assert!(xml.contains("<SVCURRENTCOMPANY>Acme &amp; Co</SVCURRENTCOMPANY>"));
        assert!(xml.contains(r#"<COLLECTION NAME="List of Groups" ISMODIFY="No"><TYPE>Group</TYPE>"#));
        assert!(xml.contains("<FETCH>NAME, PARENT, ISREVENUE"));
        assert!(xml.ends_with("</ENVELOPE>"));
    }

    #[test]
    fn test_company_list_is_not_scoped() {
        let xml = build_envelope(&TallyRequest::new(EntityKind::Company)).unwrap();
        assert!(!xml.contains("SVCURRENTCOMPANY"));
        assert!(xml.contains("<ID>List of Companies</ID>"));
    }

    #[test]
    fn test_day_book_envelope() {
        let request = TallyRequest::new(EntityKind::Voucher)
            .company("Acme")
            .range(
                NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 4, 7).unwrap(),
            );
        let xml = build_envelope(&request).unwrap();
        assert!(xml.contains("<TYPE>Data</TYPE><ID>Day Book</ID>"));
        assert!(xml.contains("<SVFROMDATE>20240401</SVFROMDATE><SVTODATE>20240407</SVTODATE>"));
        assert!(xml.contains("<EXPLODEFLAG>Yes</EXPLODEFLAG>"));
        assert!(!xml.contains("<TDL>"));
    }

    #[test]
    fn test_extra_static_vars_override() {
        let request = TallyRequest::new(EntityKind::Ledger)
            .company("Acme")
            .static_var("svexportformat", "$$SysName:UTF8XML");
        let xml = build_envelope(&request).unwrap();
        assert!(xml.contains("<SVEXPORTFORMAT>$$SysName:UTF8XML</SVEXPORTFORMAT>"));
        assert_eq!(xml.matches("SVEXPORTFORMAT>").count(), 2);
    }

    #[test]
    fn test_invalid_request_is_rejected_before_serializing() {
        let request = TallyRequest::new(EntityKind::Voucher).company("Acme");
        assert!(matches!(
            build_envelope(&request),
            Err(AppError::ConfigurationError(_))
        ));
    }
}
