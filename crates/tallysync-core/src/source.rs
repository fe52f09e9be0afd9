//! Source side of the pipeline: what the orchestrator asks Tally for.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::AppError;
use crate::models::EntityKind;

/// One export request against Tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyRequest {
    pub kind: EntityKind,
    /// Company to open with `SVCURRENTCOMPANY`.
    pub company: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// FETCH list; empty means the kind's default.
    pub fields: Vec<String>,
    /// Extra static variables, sent after the ones derived from the request.
    pub static_vars: Vec<(String, String)>,
}

impl TallyRequest {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            company: None,
            from: None,
            to: None,
            fields: Vec::new(),
            static_vars: Vec::new(),
        }
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn static_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_vars.push((name.into(), value.into()));
        self
    }

    /// Fields to FETCH: explicit ones, or the kind's defaults.
    pub fn fetch_list(&self) -> Vec<String> {
        if self.fields.is_empty() {
            self.kind
                .default_fetch()
                .iter()
                .map(|f| f.to_string())
                .collect()
        } else {
            self.fields.clone()
        }
    }

    /// Checks the request before anything is sent.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.kind.is_company_scoped()
            && self.company.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(AppError::ConfigurationError(format!(
                "{} export requires a company",
                self.kind
            )));
        }
        if self.kind == EntityKind::Voucher {
            match (self.from, self.to) {
                (Some(from), Some(to)) if from <= to => {}
                (Some(from), Some(to)) => {
                    return Err(AppError::ConfigurationError(format!(
                        "voucher range starts after it ends ({} > {})",
                        from, to
                    )))
                }
                _ => {
                    return Err(AppError::ConfigurationError(
                        "voucher export requires a date range".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Short label used in logs and error messages.
    pub fn describe(&self) -> String {
        let mut label = self.kind.request_id().to_string();
        if let Some(company) = &self.company {
            label.push_str(&format!(" [{}]", company));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            label.push_str(&format!(" {}..{}", from, to));
        }
        label
    }
}

/// Anything that can answer a [`TallyRequest`] with raw XML.
///
/// The HTTP client implements this; tests script it.
#[async_trait]
pub trait TallySource: Send + Sync {
    /// Fetches the raw response body. Retries, if any, happen inside.
    async fn fetch(&self, request: &TallyRequest) -> Result<String, AppError>;
}
