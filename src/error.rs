// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level error taxonomy.
//!
//! Every request-path operation returns [`EngineError`]. The HTTP layer that
//! sits in front of the engine maps it to a status code with
//! [`EngineError::status_code`]:
//!
//! | Variant      | Status | Raised when                                           |
//! |--------------|--------|-------------------------------------------------------|
//! | `BadRequest` | 400    | contradictory options, re-routing an existing key     |
//! | `NotFound`   | 404    | no tier produced a value                              |
//! | `Server`     | 500    | schema resolution failed permanently                  |
//! | `Storage`    | 500    | a backend or codec failed                             |
//! | `Storage`    | 400    | a table or column name is not a valid identifier      |

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// HTTP status the boundary layer should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Storage(StorageError::InvalidInput(_)) => 400,
            Self::NotFound(_) => 404,
            Self::Server(_) | Self::Storage(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::bad_request("x").status_code(), 400);
        assert_eq!(EngineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(EngineError::server("x").status_code(), 500);
        assert_eq!(
            EngineError::from(StorageError::Backend("down".into())).status_code(),
            500
        );
        assert_eq!(
            EngineError::from(StorageError::Rejected("no such table".into())).status_code(),
            500
        );
        assert_eq!(
            EngineError::from(StorageError::InvalidInput("a b".into())).status_code(),
            400
        );
    }

    #[test]
    fn test_display_includes_message() {
        let err = EngineError::bad_request("table cannot change");
        assert_eq!(err.to_string(), "Bad request: table cannot change");
    }
}
