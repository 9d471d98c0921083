use axum::{
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cloudinary::CloudinaryError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0} not found")]
    NotFound(Uri),

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0} must unique")]
    MustUniqueError(String),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    BSONDeError(#[from] bson::de::Error),

    #[error("membership still has {days_remaining} days remaining, renewal opens 7 days before expiry")]
    RenewalNotAllowed { days_remaining: i64 },

    #[error("membership is {0}")]
    InvalidMembershipState(&'static str),

    #[error("{0}")]
    UploadError(#[from] CloudinaryError),

    #[error("{0}")]
    MultipartError(#[from] axum::extract::multipart::MultipartError),

    #[error("{1}")]
    CustomStatus(StatusCode, anyhow::Error),

    #[error("{1}")]
    CustomStr(StatusCode, &'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Wrong Username or Password")]
    WrongUsernameOrPassword,

    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<serde_json::Value>,
    r#type: String,
    message: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let message = err.to_string();

        let r#type = err.to_string_variant();

        let errors = match err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::RenewalNotAllowed { days_remaining } => {
                Some(serde_json::json!({ "days_remaining": days_remaining }))
            }
            Error::NotFound(..)
            | Error::NoResource
            | Error::PasswordHashError(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::BSONSerError(..)
            | Error::BSONDeError(..)
            | Error::MustUniqueError(..)
            | Error::Unauthorized(..)
            | Error::Forbidden
            | Error::InvalidMembershipState(..)
            | Error::UploadError(..)
            | Error::MultipartError(..)
            | Error::CustomStr(..)
            | Error::CustomStatus(..) => None,
        };

        Self {
            errors,
            message,
            r#type,
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(..)
            | Self::MustUniqueError(..)
            | Self::RenewalNotAllowed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidMembershipState(..) => StatusCode::CONFLICT,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(..) | Self::NoResource => StatusCode::NOT_FOUND,
            Self::MultipartError(..) => StatusCode::BAD_REQUEST,
            Self::UploadError(err) => err.status(),
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..)
            | Self::BSONDeError(..) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CustomStatus(code, ..) | Self::CustomStr(code, ..) => *code,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = self.status();

        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl Error {
    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            NotFound(..),
            NoResource!,
            Forbidden!,
            ValidationError(..),
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..),
            BSONDeError(..),
            MustUniqueError(..),
            Unauthorized(..),
            RenewalNotAllowed{..},
            InvalidMembershipState(..),
            UploadError(..),
            MultipartError(..),
            CustomStatus(..),
            CustomStr(..)
        }
        .to_string()
    }
}

impl From<axum::extract::rejection::PathRejection> for Error {
    fn from(_value: axum::extract::rejection::PathRejection) -> Self {
        Self::NoResource
    }
}
