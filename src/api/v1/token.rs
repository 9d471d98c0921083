use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use bson::oid::ObjectId;
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    config::JwtKeys,
    error::{Error, UnauthorizedType},
    mongo_ext::Collection,
    util::{hash_password, ObjectIdString},
};

use super::auth::{UserModel, UserRole};

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn from_keys(keys: &JwtKeys) -> Result<Self, Error> {
        match keys {
            JwtKeys::Rsa {
                private_pem,
                public_pem,
            } => {
                let decode = |key: &str| {
                    general_purpose::STANDARD.decode(key).map_err(|err| {
                        Error::CustomStatus(
                            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                            anyhow::anyhow!("JWT key is not valid base64: {err}"),
                        )
                    })
                };
                let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(&decode(private_pem)?)?;
                let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(&decode(public_pem)?)?;

                Ok(Self::new(
                    jsonwebtoken::Algorithm::RS256,
                    encoding_key,
                    decoding_key,
                ))
            }
            JwtKeys::Hmac(secret) => Ok(Self::new_hmac(secret.as_bytes())),
        }
    }

    pub fn new_hmac(secret: &[u8]) -> Self {
        Self::new(
            jsonwebtoken::Algorithm::HS256,
            jsonwebtoken::EncodingKey::from_secret(secret),
            jsonwebtoken::DecodingKey::from_secret(secret),
        )
    }

    fn new(
        algorithm: jsonwebtoken::Algorithm,
        encoding_key: jsonwebtoken::EncodingKey,
        decoding_key: jsonwebtoken::DecodingKey,
    ) -> Self {
        let header = jsonwebtoken::Header::new(algorithm);
        let mut validation = jsonwebtoken::Validation::new(algorithm);
        // expiry is checked by the claims so expired tokens map to our own error
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key,
            decoding_key,
        }
    }
}

#[derive(Clone)]
pub struct RefreshTokenCollection(pub Collection<RefreshTokenModel>);

impl std::ops::Deref for RefreshTokenCollection {
    type Target = Collection<RefreshTokenModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshTokenClaims {
    pub sub: ObjectIdString,
    pub user_id: ObjectIdString,
    pub exp: i64,
}

impl RefreshTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshTokenModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    pub token: String,
    pub expired_at: bson::DateTime,
}

pub async fn create_refresh_token(
    jwt_state: &JwtState,
    argon: &Argon2<'_>,
    refresh_tokens: RefreshTokenCollection,
    user: &UserModel,
) -> Result<String, Error> {
    let (model, token) = generate_refresh_token_model(jwt_state, argon, user)?;

    refresh_tokens.insert_one(model, None).await?;

    Ok(token)
}

pub fn generate_refresh_token_model(
    jwt_state: &JwtState,
    argon: &Argon2,
    user: &UserModel,
) -> Result<(RefreshTokenModel, String), Error> {
    let expired_at = current_timestamp() + Duration::weeks(1);

    generate_refresh_token_model_with_exp(jwt_state, argon, user, expired_at)
}

pub fn generate_refresh_token_model_with_exp(
    jwt_state: &JwtState,
    argon: &Argon2,
    user: &UserModel,
    expired_at: OffsetDateTime,
) -> Result<(RefreshTokenModel, String), Error> {
    let id = ObjectId::new();
    let token = generate_refresh_token_string(jwt_state, id, user.id, expired_at.unix_timestamp())?;

    Ok((
        RefreshTokenModel {
            id,
            user_id: user.id,
            token: hash_password(argon, &token)?,
            expired_at: expired_at.into(),
        },
        token,
    ))
}

pub fn generate_refresh_token_string(
    jwt_state: &JwtState,
    id: ObjectId,
    user_id: ObjectId,
    exp: i64,
) -> Result<String, Error> {
    let claims = RefreshTokenClaims {
        sub: id.into(),
        user_id: user_id.into(),
        exp,
    };

    jsonwebtoken::encode(&jwt_state.header, &claims, &jwt_state.encoding_key).map_err(Into::into)
}

pub fn decode_refresh_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<RefreshTokenClaims>, Error> {
    let token: TokenData<RefreshTokenClaims> =
        jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation)?;

    if token.claims.is_expired() {
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    Ok(token)
}

#[derive(Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: ObjectIdString,
    pub user_role: UserRole,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    user: &UserModel,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + Duration::minutes(10);
    let token = generate_access_token_with_exp(jwt_state, user, expired_at.unix_timestamp())?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    user: &UserModel,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            sub: user.id.into(),
            user_role: user.role,
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}
