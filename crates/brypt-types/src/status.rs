//! Reply status codes.
//!
//! A status code rides on every reply parcel as a two-byte field. The
//! numeric values follow the HTTP-flavored catalog of the wire protocol.

use serde::{Deserialize, Serialize};

/// Status carried on a reply parcel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Unknown,
    Ok,
    Created,
    Accepted,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Conflict,
    PayloadTooLarge,
    TooManyRequests,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl StatusCode {
    /// The two-byte wire value.
    pub fn value(self) -> u16 {
        match self {
            StatusCode::Unknown => 0,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::Conflict => 409,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::TooManyRequests => 429,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    /// Decode a wire value; unrecognized values map to [`StatusCode::Unknown`].
    pub fn from_value(value: u16) -> Self {
        match value {
            200 => StatusCode::Ok,
            201 => StatusCode::Created,
            202 => StatusCode::Accepted,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            408 => StatusCode::RequestTimeout,
            409 => StatusCode::Conflict,
            413 => StatusCode::PayloadTooLarge,
            429 => StatusCode::TooManyRequests,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            503 => StatusCode::ServiceUnavailable,
            _ => StatusCode::Unknown,
        }
    }

    /// True for the 2xx range.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        for status in [
            StatusCode::Ok,
            StatusCode::NoContent,
            StatusCode::NotFound,
            StatusCode::Conflict,
            StatusCode::RequestTimeout,
            StatusCode::InternalServerError,
        ] {
            assert_eq!(StatusCode::from_value(status.value()), status);
        }
    }

    #[test]
    fn test_unrecognized_maps_to_unknown() {
        assert_eq!(StatusCode::from_value(999), StatusCode::Unknown);
    }

    #[test]
    fn test_success_range() {
        assert!(StatusCode::Ok.is_success());
        assert!(StatusCode::NoContent.is_success());
        assert!(!StatusCode::NotFound.is_success());
        assert!(!StatusCode::Unknown.is_success());
    }
}
