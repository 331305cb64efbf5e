//! Proxy error model.
//!
//! Every failure that reaches a client is rendered as an S3 style XML body
//! with an `ErrorSource` element distinguishing errors raised by the proxy
//! itself from errors relayed from a storage backend.

use hyper::StatusCode;

use std::error::Error as StdError;
use std::fmt;

pub type HeraldResult<T = ()> = Result<T, HeraldError>;

pub type BoxStdError = Box<dyn StdError + Send + Sync + 'static>;

macro_rules! herald_error {
    ($code:ident) => {
        $crate::error::HeraldError::new($crate::error::HeraldErrorCode::$code)
    };
    ($code:ident, $($arg:tt)+) => {{
        let mut err = $crate::error::HeraldError::new($crate::error::HeraldErrorCode::$code);
        err.set_message(format!($($arg)+));
        err
    }};
}

macro_rules! invalid_request {
    ($($arg:tt)+) => {
        herald_error!(InvalidRequest, $($arg)+)
    };
}

/// Subset of S3 error codes emitted by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeraldErrorCode {
    AccessDenied,
    AuthorizationHeaderMalformed,
    BucketAlreadyExists,
    IncompleteBody,
    InternalError,
    InvalidAccessKeyId,
    InvalidArgument,
    InvalidBucketName,
    InvalidRequest,
    InvalidURI,
    MethodNotAllowed,
    MissingContentLength,
    MissingSecurityHeader,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    NotImplemented,
    PreconditionFailed,
    RequestTimeTooSkewed,
    ServiceUnavailable,
    SignatureDoesNotMatch,
}

impl HeraldErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::AuthorizationHeaderMalformed => "AuthorizationHeaderMalformed",
            Self::BucketAlreadyExists => "BucketAlreadyExists",
            Self::IncompleteBody => "IncompleteBody",
            Self::InternalError => "InternalError",
            Self::InvalidAccessKeyId => "InvalidAccessKeyId",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidBucketName => "InvalidBucketName",
            Self::InvalidRequest => "InvalidRequest",
            Self::InvalidURI => "InvalidURI",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::MissingContentLength => "MissingContentLength",
            Self::MissingSecurityHeader => "MissingSecurityHeader",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::NoSuchUpload => "NoSuchUpload",
            Self::NotImplemented => "NotImplemented",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
        }
    }

    #[must_use]
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::AccessDenied
            | Self::InvalidAccessKeyId
            | Self::RequestTimeTooSkewed
            | Self::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            Self::AuthorizationHeaderMalformed
            | Self::IncompleteBody
            | Self::InvalidArgument
            | Self::InvalidBucketName
            | Self::InvalidRequest
            | Self::InvalidURI
            | Self::MissingSecurityHeader => StatusCode::BAD_REQUEST,
            Self::BucketAlreadyExists => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            Self::NoSuchBucket | Self::NoSuchKey | Self::NoSuchUpload => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Where an error originated, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorSource {
    #[default]
    Proxy,
    Backend,
}

impl ErrorSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "Proxy",
            Self::Backend => "S3 Server",
        }
    }
}

pub struct HeraldError {
    code: HeraldErrorCode,
    message: Option<String>,
    origin: ErrorSource,
    source: Option<BoxStdError>,
}

impl HeraldError {
    #[must_use]
    pub fn new(code: HeraldErrorCode) -> Self {
        Self {
            code,
            message: None,
            origin: ErrorSource::Proxy,
            source: None,
        }
    }

    #[must_use]
    pub fn with_message(code: HeraldErrorCode, message: impl Into<String>) -> Self {
        let mut err = Self::new(code);
        err.set_message(message.into());
        err
    }

    /// Wraps an unexpected failure. The cause is logged, never sent to the client.
    #[must_use]
    pub fn internal(source: impl Into<BoxStdError>) -> Self {
        let mut err = Self::new(HeraldErrorCode::InternalError);
        err.set_source(source.into());
        err
    }

    /// A backend could not be reached or produced a transport level failure.
    #[must_use]
    pub fn upstream(source: impl Into<BoxStdError>) -> Self {
        let mut err = Self::new(HeraldErrorCode::ServiceUnavailable);
        err.set_origin(ErrorSource::Backend);
        err.set_source(source.into());
        err
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn set_origin(&mut self, origin: ErrorSource) {
        self.origin = origin;
    }

    pub fn set_source(&mut self, source: BoxStdError) {
        self.source = Some(source);
    }

    #[must_use]
    pub fn code(&self) -> HeraldErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn origin(&self) -> ErrorSource {
        self.origin
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    /// Renders the S3 style XML error document.
    #[must_use]
    pub fn to_xml(&self, request_id: &str) -> String {
        let body = crate::xml::ErrorBody {
            code: self.code.as_str().to_owned(),
            message: self
                .message
                .clone()
                .unwrap_or_else(|| self.code.as_str().to_owned()),
            error_source: self.origin.as_str().to_owned(),
            request_id: Some(request_id.to_owned()),
        };
        crate::xml::to_xml(&body).unwrap_or_else(|_| {
            // Serialization of a flat struct cannot realistically fail.
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code></Error>",
                self.code.as_str()
            )
        })
    }
}

impl fmt::Debug for HeraldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("HeraldError");
        d.field("code", &self.code);
        if let Some(ref message) = self.message {
            d.field("message", message);
        }
        d.field("origin", &self.origin);
        if let Some(ref source) = self.source {
            d.field("source", source);
        }
        d.finish_non_exhaustive()
    }
}

impl fmt::Display for HeraldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if let Some(ref message) = self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl StdError for HeraldError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|s| &**s as &(dyn StdError + 'static))
    }
}

impl From<HeraldErrorCode> for HeraldError {
    fn from(code: HeraldErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<reqwest::Error> for HeraldError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(HeraldErrorCode::NoSuchKey.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            HeraldErrorCode::SignatureDoesNotMatch.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            HeraldErrorCode::MissingContentLength.status_code(),
            StatusCode::LENGTH_REQUIRED
        );
    }

    #[test]
    fn xml_body_shape() {
        let err = herald_error!(NoSuchBucket, "bucket {} is not configured", "photos");
        let xml = err.to_xml("req-1");
        assert!(xml.contains("<Code>NoSuchBucket</Code>"));
        assert!(xml.contains("<Message>bucket photos is not configured</Message>"));
        assert!(xml.contains("<ErrorSource>Proxy</ErrorSource>"));
    }

    #[test]
    fn upstream_errors_are_tagged() {
        let mut err = HeraldError::new(HeraldErrorCode::ServiceUnavailable);
        err.set_origin(ErrorSource::Backend);
        assert!(err.to_xml("req-2").contains("<ErrorSource>S3 Server</ErrorSource>"));
    }
}
