// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
    Unknown,
}

impl Method {
    /// Method tokens are matched case-insensitively.
    pub fn from_bytes(b: &[u8]) -> Self {
        const TABLE: [(&[u8], Method); 9] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"HEAD", Method::Head),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"TRACE", Method::Trace),
            (b"OPTIONS", Method::Options),
            (b"CONNECT", Method::Connect),
            (b"PATCH", Method::Patch),
        ];
        TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b))
            .map(|&(_, m)| m)
            .unwrap_or(Method::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"HTTP/1.1") {
            Some(Version::Http11)
        } else {
            None
        }
    }
}

/// Outcome of feeding the parser; drives response assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete, more bytes needed.
    NoRequest,
    /// A complete request was parsed.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// The target file is resolved and ready to send.
    FileRequest,
    InternalError,
}

/// Status line and canned body for each response the server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub title: &'static str,
    pub form: &'static str,
}

pub const OK_200: Status = Status {
    code: 200,
    title: "OK",
    form: "",
};
pub const ERROR_400: Status = Status {
    code: 400,
    title: "Bad Request",
    form: "Your request has bad syntax or is inherently impossible to satisfy.\n",
};
pub const ERROR_403: Status = Status {
    code: 403,
    title: "Forbidden",
    form: "You do not have permission to get file from this server.\n",
};
pub const ERROR_404: Status = Status {
    code: 404,
    title: "Not Found",
    form: "The requested file was not found on this server.\n",
};
pub const ERROR_500: Status = Status {
    code: 500,
    title: "Internal Error",
    form: "There was an unusual problem serving the requested file.\n",
};

/// Body sent for a zero-length file.
pub const EMPTY_DOCUMENT: &str = "<html><body></body></html>";

impl HttpCode {
    /// Error status for outcomes answered with a canned body.
    pub fn error_status(self) -> Option<Status> {
        match self {
            HttpCode::BadRequest => Some(ERROR_400),
            HttpCode::ForbiddenRequest => Some(ERROR_403),
            HttpCode::NoResource => Some(ERROR_404),
            HttpCode::InternalError => Some(ERROR_500),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_lookup_is_case_insensitive() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"get"), Method::Get);
        assert_eq!(Method::from_bytes(b"Post"), Method::Post);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
    }

    #[test]
    fn only_http11_is_recognised() {
        assert_eq!(Version::from_bytes(b"HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::from_bytes(b"http/1.1"), Some(Version::Http11));
        assert_eq!(Version::from_bytes(b"HTTP/1.0"), None);
        assert_eq!(Version::from_bytes(b"HTTP/2"), None);
    }

    #[test]
    fn error_outcomes_map_to_canned_statuses() {
        assert_eq!(HttpCode::NoResource.error_status().unwrap().code, 404);
        assert_eq!(HttpCode::ForbiddenRequest.error_status().unwrap().code, 403);
        assert_eq!(HttpCode::BadRequest.error_status().unwrap().code, 400);
        assert_eq!(HttpCode::InternalError.error_status().unwrap().code, 500);
        assert_eq!(HttpCode::FileRequest.error_status(), None);
        assert_eq!(HttpCode::NoRequest.error_status(), None);
    }
}
