use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use tallysync_core::config::{HttpConfig, TallyConfig};
use tallysync_core::error::AppError;
use tallysync_core::models::{EntityKind, FiscalYear, SourceBatch};
use tallysync_core::parse::{records, NormalizeContext};
use tallysync_core::source::{TallyRequest, TallySource};
use tracing::debug;
use uuid::Uuid;

use crate::envelope::build_envelope;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// How much of a response is searched for plain-text error markers.
const SNIFF_LEN: usize = 4096;

/// Error markers Tally places in an HTTP 200 body.
const SENTINELS: [&str; 3] = [
    "Unknown Request",
    "Could not find Report",
    "Could not set 'SVCurrentCompany'",
];

/// HTTP client for the Tally XML server.
///
/// Every export is a POST of an XML envelope to the server root. Tally
/// reports most errors with HTTP 200, so the body is checked for in-band
/// error markers before it is handed on.
///
/// # Examples
///
/// ```no_run
/// use tallysync_client::TallyClient;
/// use tallysync_core::config::{HttpConfig, TallyConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = TallyClient::new(&TallyConfig::default(), HttpConfig::default())?;
/// for company in client.list_companies().await? {
///     println!("{}", company);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TallyClient {
    client: Client,
    endpoint: Url,
    http: HttpConfig,
    fiscal_year_start_month: u32,
}

impl TallyClient {
    /// Creates a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigurationError` if the host or port is unusable.
    /// Returns `AppError::TransportError` if the HTTP client cannot be built.
    pub fn new(tally: &TallyConfig, http: HttpConfig) -> Result<Self, AppError> {
        let endpoint = tally.endpoint()?;
        let client = Client::builder()
            .user_agent(concat!("tallysync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::TransportError(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            http,
            fiscal_year_start_month: 4,
        })
    }

    /// Sets the first month of the fiscal year used when normalizing
    /// responses read outside a sync run. Defaults to April.
    pub fn with_fiscal_year_start_month(mut self, month: u32) -> Self {
        self.fiscal_year_start_month = month;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn fiscal_year_start_month(&self) -> u32 {
        self.fiscal_year_start_month
    }

    /// Sends `request`, retrying transport failures with backoff.
    pub async fn export(&self, request: &TallyRequest) -> Result<String, AppError> {
        let body = build_envelope(request)?;
        let label = request.describe();
        let timeout = self.http.timeout_for(request.kind);
        let policy = RetryPolicy::new(self.http.max_retries, self.http.retry_base_delay);

        retry_with_backoff(policy, &label, |attempt| {
            debug!(request = %label, attempt, "Sending Tally request");
            self.send_once(&label, body.clone(), timeout)
        })
        .await
    }

    async fn send_once(&self, label: &str, body: String, timeout: Duration) -> Result<String, AppError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(AppError::TransportError(format!(
                "HTTP {} from {}",
                status.as_u16(),
                self.endpoint
            )));
        }
        if !status.is_success() {
            return Err(AppError::ProtocolError {
                request: label.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| transport_error(e, timeout))?;
        let text = decode_body(&bytes);
        check_response(label, &text, self.http.min_response_len)?;
        debug!(request = %label, bytes = text.len(), "Tally response accepted");
        Ok(text)
    }

    /// Names of the companies currently open in Tally.
    pub async fn list_companies(&self) -> Result<Vec<String>, AppError> {
        let request = TallyRequest::new(EntityKind::Company);
        let raw = self.export(&request).await?;
        let ctx = NormalizeContext {
            company: String::new(),
            fiscal_year: FiscalYear::containing(
                Local::now().date_naive(),
                self.fiscal_year_start_month,
            ),
            fiscal_year_start_month: self.fiscal_year_start_month,
            source: SourceBatch::new(Uuid::nil(), Utc::now()),
        };
        let mut names = Vec::new();
        for record in records(&raw, EntityKind::Company, ctx) {
            if let Some(name) = record?.text("name") {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Checks that the Tally server answers at all.
    pub async fn ping(&self) -> Result<(), AppError> {
        let resp = self
            .client
            .get(self.endpoint.clone())
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.http.timeout))?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(AppError::TransportError(format!(
                "Tally answered HTTP {}",
                status.as_u16()
            ))),
        }
    }
}

#[async_trait]
impl TallySource for TallyClient {
    async fn fetch(&self, request: &TallyRequest) -> Result<String, AppError> {
        self.export(request).await
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs_f64().ceil() as u64)
    } else if e.is_connect() {
        AppError::TransportError(format!("Connection failed: {}", e))
    } else {
        AppError::TransportError(e.to_string())
    }
}

/// Decodes a response body.
///
/// Tally exports UTF-16LE by default, usually with a byte-order mark.
/// Anything without a UTF-16 signature is read as UTF-8, replacing invalid
/// sequences.
pub fn decode_body(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        // no BOM but "<\0": little-endian without signature
        [b'<', 0, ..] => decode_utf16(bytes, u16::from_le_bytes),
        [0, b'<', ..] => decode_utf16(bytes, u16::from_be_bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Rejects bodies that are empty or carry one of Tally's error markers.
pub fn check_response(label: &str, body: &str, min_len: usize) -> Result<(), AppError> {
    let trimmed = body.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.len() < min_len {
        return Err(AppError::EmptyResponse {
            request: label.to_string(),
            len: trimmed.len(),
        });
    }

    let head = match trimmed.char_indices().nth(SNIFF_LEN) {
        Some((end, _)) => &trimmed[..end],
        None => trimmed,
    };
    let protocol = |message: String| AppError::ProtocolError {
        request: label.to_string(),
        message,
    };

    if let Some(line) = tag_text(head, "LINEERROR") {
        return Err(protocol(line.to_string()));
    }
    if let Some(marker) = SENTINELS.iter().find(|s| head.contains(*s)) {
        let message = tag_text(head, "RESPONSE").unwrap_or(marker);
        return Err(protocol(message.to_string()));
    }
    if tag_text(head, "STATUS") == Some("0") {
        let errors = count_in(head, "ERRORS") + count_in(head, "EXCEPTIONS");
        if errors > 0 {
            return Err(protocol(format!("request failed with {} error(s)", errors)));
        }
    }
    Ok(())
}

fn tag_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = start + body[start..].find(&close)?;
    Some(body[start..end].trim())
}

fn count_in(body: &str, tag: &str) -> u64 {
    tag_text(body, tag).and_then(|v| v.parse().ok()).unwrap_or(0)
}
