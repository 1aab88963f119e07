use std::error::Error;
use std::io::ErrorKind;

use http::StatusCode;

use crate::store::StoreError;

/// Errors produced while handling a CalDAV request.
///
/// Every variant maps onto a HTTP status through [`DavError::statuscode`].
#[derive(Debug)]
pub enum DavError {
    XmlReadError,  // error reading/parsing xml
    XmlParseError, // error interpreting xml
    BadPath,       // path could not be normalized
    BadRequest(String),
    NotFound,
    Conflict,
    // optional precondition element for the DAV:error body
    Forbidden(Option<&'static str>),
    PreconditionFailed,
    ServerError(String),
    UnsupportedMediaType,
    MethodNotAllowed,
    Unauthorized,
    UnknownDavMethod,
    Status(StatusCode),
    StatusClose(StatusCode),
    StoreError(StoreError),
    IoError(std::io::Error),
    XmlReaderError(xml::reader::Error),
    XmlWriterError(xml::writer::Error),
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::StoreError(e) => Some(e),
            DavError::IoError(e) => Some(e),
            DavError::XmlReaderError(e) => Some(e),
            DavError::XmlWriterError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DavError::XmlReaderError(_) => write!(f, "XML parse error"),
            DavError::XmlWriterError(_) => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            DavError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            DavError::ServerError(msg) => write!(f, "server error: {msg}"),
            DavError::StoreError(e) => write!(f, "store error: {e}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl From<StoreError> for DavError {
    fn from(e: StoreError) -> Self {
        DavError::StoreError(e)
    }
}

impl From<DavError> for std::io::Error {
    fn from(e: DavError) -> Self {
        std::io::Error::other(e)
    }
}

impl From<std::io::Error> for DavError {
    fn from(e: std::io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

impl From<xml::reader::Error> for DavError {
    fn from(e: xml::reader::Error) -> Self {
        DavError::XmlReaderError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

fn ioerror_to_status(ioerror: &std::io::Error) -> StatusCode {
    match ioerror.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub(crate) fn storeerror_to_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        StoreError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
        StoreError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Forbidden => StatusCode::FORBIDDEN,
        StoreError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
        StoreError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        StoreError::BadData(_) => StatusCode::BAD_REQUEST,
        StoreError::Conflict => StatusCode::CONFLICT,
    }
}

impl DavError {
    pub fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::BadPath => StatusCode::BAD_REQUEST,
            DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::NotFound => StatusCode::NOT_FOUND,
            DavError::Conflict => StatusCode::CONFLICT,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            DavError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DavError::Unauthorized => StatusCode::UNAUTHORIZED,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::StoreError(e) => storeerror_to_status(e),
            DavError::Status(e) => *e,
            DavError::StatusClose(e) => *e,
            DavError::XmlReaderError(_) => StatusCode::BAD_REQUEST,
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        !matches!(
            self,
            DavError::Status(_)
                | DavError::NotFound
                | DavError::Forbidden(_)
                | DavError::PreconditionFailed
                | DavError::Conflict
                | DavError::StoreError(_)
        )
    }

    // precondition element to put in a DAV:error body, if any.
    pub(crate) fn precondition(&self) -> Option<&'static str> {
        match self {
            DavError::Forbidden(p) => *p,
            _ => None,
        }
    }
}
