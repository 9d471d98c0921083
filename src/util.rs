use std::str::FromStr;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{FromRequestParts, Path},
    http::request::Parts,
    RequestPartsExt,
};
use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ObjectIdString(#[serde(with = "object_id_string")] pub ObjectId);

impl From<ObjectId> for ObjectIdString {
    fn from(value: ObjectId) -> Self {
        Self(value)
    }
}

impl From<ObjectIdString> for ObjectId {
    fn from(value: ObjectIdString) -> Self {
        value.0
    }
}

impl std::ops::Deref for ObjectIdString {
    type Target = ObjectId;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::cmp::PartialEq for ObjectIdString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl std::cmp::Eq for ObjectIdString {}

impl std::cmp::PartialEq<ObjectId> for ObjectIdString {
    fn eq(&self, other: &ObjectId) -> bool {
        self.0 == *other
    }
}

impl From<ObjectIdString> for bson::Bson {
    fn from(value: ObjectIdString) -> Self {
        value.0.into()
    }
}

mod object_id_string {
    use bson::oid::ObjectId;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(id: &ObjectId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ObjectId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Path segment parsed as an [`ObjectId`]. Anything unparsable is a missing resource.
#[derive(Debug, Clone, Copy)]
pub struct PathObjectId(pub ObjectId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for PathObjectId
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = parts.extract::<Path<String>>().await?;

        ObjectId::from_str(&id)
            .map(Self)
            .map_err(|_| Error::NoResource)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FormattedDateTime(#[serde(with = "time::serde::rfc3339")] pub OffsetDateTime);

impl From<bson::DateTime> for FormattedDateTime {
    fn from(value: bson::DateTime) -> Self {
        Self(value.into())
    }
}

impl From<OffsetDateTime> for FormattedDateTime {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn verify_password(argon: &Argon2, password: &str, hashed: &str) -> bool {
    let hashed = match PasswordHash::new(hashed) {
        Ok(hashed) => hashed,
        Err(_) => return false,
    };

    argon.verify_password(password.as_bytes(), &hashed).is_ok()
}

pub fn hash_password(argon: &Argon2, password: &str) -> Result<String, Error> {
    let salt = password_hash::SaltString::generate(&mut password_hash::rand_core::OsRng);

    argon
        .hash_password(password.as_bytes(), &salt)
        .map(|it| it.to_string())
        .map_err(Into::into)
}

/// Decimal that always serializes as a string and accepts strings or numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DecimalString(pub Decimal);

impl From<Decimal> for DecimalString {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<DecimalString> for Decimal {
    fn from(value: DecimalString) -> Self {
        value.0
    }
}

impl Serialize for DecimalString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        pub struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = DecimalString;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string of decimal or integer")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Decimal::from(v).into())
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Decimal::from(v).into())
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Decimal::try_from(v)
                    .map(Into::into)
                    .map_err(serde::de::Error::custom)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Decimal::from_str(v.trim())
                    .map(Into::into)
                    .map_err(serde::de::Error::custom)
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
