use std::fmt;

use super::types::ContextError;

/// Header carrying the application-supplied identity hint.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Status codes this crate emits or inspects during the upgrade exchange.
///
/// The reason phrase is derived from the variant name by splitting at upper-case
/// boundaries, so `NotFound` renders as `"Not Found"` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    SwitchingProtocols,
    OK,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    UpgradeRequired,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::OK => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::Conflict => 409,
            StatusCode::UpgradeRequired => 426,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, ContextError> {
        match code {
            101 => Ok(StatusCode::SwitchingProtocols),
            200 => Ok(StatusCode::OK),
            400 => Ok(StatusCode::BadRequest),
            401 => Ok(StatusCode::Unauthorized),
            403 => Ok(StatusCode::Forbidden),
            404 => Ok(StatusCode::NotFound),
            409 => Ok(StatusCode::Conflict),
            426 => Ok(StatusCode::UpgradeRequired),
            500 => Ok(StatusCode::InternalServerError),
            503 => Ok(StatusCode::ServiceUnavailable),
            other => Err(ContextError::UnknownStatus { code: other }),
        }
    }

    fn name(self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "SwitchingProtocols",
            StatusCode::OK => "OK",
            StatusCode::BadRequest => "BadRequest",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "NotFound",
            StatusCode::Conflict => "Conflict",
            StatusCode::UpgradeRequired => "UpgradeRequired",
            StatusCode::InternalServerError => "InternalServerError",
            StatusCode::ServiceUnavailable => "ServiceUnavailable",
        }
    }

    /// The canonical phrase for the wire: the variant name split at lower-to-upper
    /// case boundaries.
    pub fn reason_phrase(self) -> String {
        let name = self.name();
        let mut phrase = String::with_capacity(name.len() + 2);
        let mut prev_lower = false;
        for ch in name.chars() {
            if ch.is_ascii_uppercase() && prev_lower {
                phrase.push(' ');
            }
            prev_lower = ch.is_ascii_lowercase();
            phrase.push(ch);
        }
        phrase
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason_phrase())
    }
}

/// An HTTP/1.1 request or response as the upgrade layer sees it.
///
/// Parsed contexts keep the original header casing and order; lookups are
/// case-insensitive. Responses built for emission collect headers, a status and an
/// optional body, and render the wire image on demand.
#[derive(Clone, Debug, Default)]
pub struct WebContext {
    start_line: Option<String>,
    headers: Vec<(String, String)>,
    content: Option<String>,
    status: Option<StatusCode>,
}

impl WebContext {
    /// Parse raw handshake text. Lines split on `\r\n` (bare `\r` or `\n` are
    /// tolerated); everything after the first blank line is the body.
    pub fn from_text(raw: &str) -> Self {
        let (head, body) = split_head_body(raw);

        let mut start_line = None;
        let mut headers = Vec::new();
        for line in head.split(['\r', '\n']).filter(|l| !l.is_empty()) {
            if start_line.is_none() {
                start_line = Some(line.to_string());
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Self {
            start_line,
            headers,
            content: body.filter(|b| !b.is_empty()).map(str::to_string),
            status: None,
        }
    }

    /// Build a GET request context for the given endpoint.
    pub fn request(host: &str, port: u16, path: &str) -> Self {
        Self {
            start_line: Some(format!("GET {path} HTTP/1.1")),
            headers: vec![("Host".to_string(), format!("{host}:{port}"))],
            content: None,
            status: None,
        }
    }

    /// Empty response template handed to upgrade callbacks.
    pub fn response() -> Self {
        Self::default()
    }

    /// Response template with a status already decided.
    pub fn response_with(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn start_line(&self) -> Option<&str> {
        self.start_line.as_deref()
    }

    /// Value of the first `Host` header, without any port suffix.
    pub fn host(&self) -> Result<String, ContextError> {
        let raw = self
            .first_value("Host")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ContextError::MissingHeader {
                name: "Host".to_string(),
            })?;
        Ok(raw.split(':').next().unwrap_or_default().to_string())
    }

    /// Port from the `Host` header, 80 when unspecified.
    pub fn port(&self) -> Result<u16, ContextError> {
        let raw = self
            .first_value("Host")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ContextError::MissingHeader {
                name: "Host".to_string(),
            })?;
        Ok(raw
            .split_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(80))
    }

    /// Second token of the request line.
    pub fn request_path(&self) -> Result<String, ContextError> {
        self.start_token(1)
    }

    /// Status of this context: the explicitly set one, or the second token of the
    /// start line parsed as a number.
    pub fn status_code(&self) -> Result<StatusCode, ContextError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let token = self.start_token(1)?;
        let code: u16 = token
            .parse()
            .map_err(|_| ContextError::NonNumericStatus { token })?;
        StatusCode::from_code(code)
    }

    /// Status explicitly decided on this context, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Decide the status of a response context. Allowed exactly once.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ContextError> {
        if self.status.is_some() {
            return Err(ContextError::StatusAlreadySet);
        }
        self.status = Some(status);
        Ok(())
    }

    /// First raw value stored under `name`, case-insensitive.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values stored under `name`, with comma-separated lists expanded and the
    /// individual tokens trimmed.
    pub fn get_all_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.first_value(name).is_some()
    }

    /// True when `name` exists and any of its raw values contains `value`,
    /// case-insensitive.
    pub fn header_contains(&self, name: &str, value: &str) -> bool {
        let needle = value.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| v.to_ascii_lowercase().contains(&needle))
    }

    /// Replace the first header named `name`, or append it when absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Append a header line, keeping any existing ones with the same name.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Iterate over the stored header lines in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// RFC 6455 §4.2.1: `Connection` must list `Upgrade` and `Upgrade` must list
    /// `websocket`, both case-insensitive after comma expansion.
    pub fn is_websocket_request(&self) -> bool {
        self.get_all_values("Connection")
            .iter()
            .any(|v| v.eq_ignore_ascii_case("upgrade"))
            && self
                .get_all_values("Upgrade")
                .iter()
                .any(|v| v.eq_ignore_ascii_case("websocket"))
    }

    pub fn user_id(&self) -> Option<&str> {
        self.first_value(USER_ID_HEADER).filter(|v| !v.is_empty())
    }

    pub fn contains_user_id(&self) -> bool {
        self.user_id().is_some()
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Attach the body. Allowed exactly once.
    pub fn set_content(&mut self, content: impl Into<String>) -> Result<(), ContextError> {
        if self.content.is_some() {
            return Err(ContextError::ContentAlreadySet);
        }
        self.content = Some(content.into());
        Ok(())
    }

    /// Wire image of a request context: start line, headers, blank line.
    pub fn emit_request(&self) -> Result<String, ContextError> {
        let start = self
            .start_line
            .as_deref()
            .ok_or(ContextError::MissingStartLine)?;
        let mut out = String::with_capacity(128);
        out.push_str(start);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        Ok(out)
    }

    /// Wire image of a response context: status line with the canonical reason
    /// phrase, headers, blank line, body. A `Content-Length` is added for any
    /// non-101 response carrying a body.
    pub fn emit_response(&self) -> Result<String, ContextError> {
        let status = self.status.ok_or(ContextError::MissingStartLine)?;
        let mut out = String::with_capacity(128);
        out.push_str("HTTP/1.1 ");
        out.push_str(&status.to_string());
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if let Some(body) = &self.content {
            if status != StatusCode::SwitchingProtocols && !self.contains_header("Content-Length")
            {
                out.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        out.push_str("\r\n");
        if let Some(body) = &self.content {
            out.push_str(body);
        }
        Ok(out)
    }

    fn start_token(&self, index: usize) -> Result<String, ContextError> {
        self.start_line
            .as_deref()
            .and_then(|line| line.split_whitespace().nth(index))
            .map(str::to_string)
            .ok_or(ContextError::MissingStartLine)
    }
}

fn split_head_body(raw: &str) -> (&str, Option<&str>) {
    for separator in ["\r\n\r\n", "\n\n", "\r\r"] {
        if let Some(at) = raw.find(separator) {
            return (&raw[..at], Some(&raw[at + separator.len()..]));
        }
    }
    (raw, None)
}
