use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization, Cookie},
    http::{header::SET_COOKIE, request::Parts, HeaderValue, StatusCode},
    response::AppendHeaders,
    Json, RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::{Error, UnauthorizedType},
    mongo_ext::{exists_filter, Collection},
    util::{hash_password, now, verify_password, FormattedDateTime, ObjectIdString},
};

use super::{
    membership::{MembershipSummary, MembershipSummaryResponse},
    token::{
        create_refresh_token, decode_access_token, decode_refresh_token, generate_access_token,
        JwtState, RefreshTokenClaims, RefreshTokenCollection,
    },
};

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,

    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub cnic: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_public_id: Option<String>,

    /// Copy of the latest membership, kept in sync on a best-effort basis.
    #[serde(default)]
    pub membership: Option<MembershipSummary>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
    #[serde(default)]
    pub deleted_at: Option<bson::DateTime>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserRole {
    #[default]
    Customer,
    Receptionist,
    Admin,
}

impl UserRole {
    pub fn is_staff(&self) -> bool {
        match self {
            Self::Customer => false,
            Self::Receptionist | Self::Admin => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Receptionist => "Receptionist",
            Self::Admin => "Admin",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
            Self::Other => "Other",
        }
    }
}

#[derive(Debug)]
pub struct UserAccess {
    pub id: ObjectId,
    pub role: UserRole,
}

impl UserAccess {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_access_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
        }

        Ok(Self {
            id: token.claims.sub.0,
            role: token.claims.user_role,
        })
    }

    pub fn require_staff(&self) -> Result<(), Error> {
        if self.role.is_staff() {
            Ok(())
        } else {
            Err(Error::Forbidden).tap_err(|_| tracing::debug!(user = %self.id, "staff only"))
        }
    }

    pub fn require_admin(&self) -> Result<(), Error> {
        match self.role {
            UserRole::Admin => Ok(()),
            UserRole::Customer | UserRole::Receptionist => {
                Err(Error::Forbidden).tap_err(|_| tracing::debug!(user = %self.id, "admin only"))
            }
        }
    }

    /// Staff may act on anyone, customers only on themselves.
    pub fn require_self_or_staff(&self, owner: ObjectId) -> Result<(), Error> {
        if self.role.is_staff() || self.id == owner {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }

    /// Editing someone else's account: admins may edit anyone, receptionists
    /// only customers.
    pub fn require_can_manage(&self, account: &UserModel) -> Result<(), Error> {
        let allowed = self.id == account.id
            || match self.role {
                UserRole::Admin => true,
                UserRole::Receptionist => account.role == UserRole::Customer,
                UserRole::Customer => false,
            };

        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden).tap_err(|_| {
                tracing::debug!(user = %self.id, account = %account.id, "account out of reach")
            })
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAccess
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

#[derive(Debug)]
pub struct RefreshToken(String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshToken
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let cookie = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("cookie not found"))?;

        let refresh_token = cookie
            .get("refresh_token")
            .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("token not found"))?;

        Ok(Self(refresh_token.to_string()))
    }
}

#[derive(Debug)]
pub struct RefreshClaim(pub RefreshTokenClaims, pub String);

impl RefreshClaim {
    pub fn from_token(jwt_state: &JwtState, refresh_token: String) -> Result<Self, Error> {
        let token = decode_refresh_token(jwt_state, &refresh_token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

        Ok(Self(token.claims, refresh_token))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshClaim
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let RefreshToken(refresh_token) = parts.extract::<RefreshToken>().await?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, refresh_token)
    }
}

impl UserModel {
    pub async fn from_id(id: ObjectId, users: &UserCollection) -> Result<Self, Error> {
        users
            .find_exists_one_by_id(id)
            .await?
            .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
    }

    #[cfg(test)]
    pub fn new_for_test(email: &str, role: UserRole) -> Self {
        Self {
            id: ObjectId::new(),
            name: "Test Member".to_string(),
            email: email.to_string(),
            password: String::new(),
            role,
            phone: None,
            cnic: None,
            gender: None,
            address: None,
            image_url: None,
            image_public_id: None,
            membership: None,
            created_at: bson::DateTime::now(),
            updated_at: bson::DateTime::now(),
            deleted_at: None,
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserModel
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<UserAccess, _>(state).await?;
        let users = UserCollection::from_ref(state);
        Self::from_id(access.id, &users).await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserResponse {
    pub id: ObjectIdString,

    pub name: String,
    pub email: String,
    pub role: UserRole,

    pub phone: Option<String>,
    pub cnic: Option<String>,
    pub gender: Option<Gender>,
    pub address: Option<String>,
    pub image_url: Option<String>,

    pub membership: Option<MembershipSummaryResponse>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            role: value.role,

            phone: value.phone,
            cnic: value.cnic,
            gender: value.gender,
            address: value.address,
            image_url: value.image_url,

            membership: value.membership.map(Into::into),

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 8, max = 64))]
    pub password: String,

    #[validate(must_match = "password")]
    pub confirm_password: String,

    #[validate(length(min = 7, max = 20))]
    pub phone: Option<String>,

    pub gender: Option<Gender>,
}

#[derive(Validate, Debug, Clone)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 8, max = 64))]
    pub password: String,

    #[validate(must_match = "password")]
    pub confirm_password: String,

    #[validate(length(min = 7, max = 20))]
    pub phone: Option<String>,

    #[validate(length(min = 13, max = 15))]
    pub cnic: Option<String>,

    pub gender: Option<Gender>,

    #[validate(length(max = 256))]
    pub address: Option<String>,

    pub role: UserRole,
}

pub async fn ensure_unique_email(users: &UserCollection, email: &str) -> Result<(), Error> {
    let count = users
        .count_documents(exists_filter(bson::doc! { "email": email }), None)
        .await?;

    if count > 0 {
        return Err(Error::MustUniqueError("email".to_string()));
    }

    Ok(())
}

pub async fn create_user(
    users: UserCollection,
    argon: Argon2<'_>,
    request: CreateUserRequest,
) -> Result<UserModel, Error> {
    request.validate()?;
    ensure_unique_email(&users, &request.email).await?;

    let model = UserModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(&argon, &request.password)?,
        role: request.role,
        phone: request.phone,
        cnic: request.cnic,
        gender: request.gender,
        address: request.address,
        image_url: None,
        image_public_id: None,
        membership: None,
        created_at: now().into(),
        updated_at: now().into(),
        deleted_at: None,
    };
    users.insert_one(&model, None).await?;

    tracing::debug!(user = %model.id, role = ?model.role, "user created");

    Ok(model)
}

pub async fn register(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, Error> {
    request.validate()?;

    create_user(
        users,
        argon,
        CreateUserRequest {
            name: request.name,
            email: request.email,
            password: request.password,
            confirm_password: request.confirm_password,
            phone: request.phone,
            cnic: None,
            gender: request.gender,
            address: None,
            role: UserRole::Customer,
        },
    )
    .await
    .map(|it| Json(it.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub refresh_token: String,
    pub access_token: String,
    pub user: UserResponse,
}

pub async fn login(
    State(users): State<UserCollection>,
    State(refresh_tokens): State<RefreshTokenCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<LoginRequest>,
) -> Result<(AppendHeaders<[(axum::http::HeaderName, HeaderValue); 1]>, Json<LoginResponse>), Error>
{
    let user = users
        .find_one(exists_filter(bson::doc! { "email": &request.email }), None)
        .await?;

    let user = match user {
        Some(user) if verify_password(&argon, &request.password, &user.password) => user,
        _ => {
            return Err(Error::Unauthorized(
                UnauthorizedType::WrongUsernameOrPassword,
            ))
        }
    };

    let refresh_token = create_refresh_token(&jwt_state, &argon, refresh_tokens, &user).await?;
    let access_token = generate_access_token(&jwt_state, &user)?;

    let cookie = HeaderValue::from_str(&format!(
        "refresh_token={}; HttpOnly; Path=/; SameSite=Strict",
        refresh_token
    ))
    .map_err(|_| {
        Error::CustomStr(
            StatusCode::INTERNAL_SERVER_ERROR,
            "refresh token is not a valid header value",
        )
    })?;

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(LoginResponse {
            refresh_token,
            access_token: access_token.token,
            user: user.into(),
        }),
    ))
}

pub async fn logout(
    State(refresh_tokens): State<RefreshTokenCollection>,
    RefreshClaim(claim, _): RefreshClaim,
) -> Result<(), Error> {
    refresh_tokens
        .get_one_by_id(claim.sub.0)
        .await?
        .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    refresh_tokens
        .delete_one(bson::doc! { "_id": claim.sub }, None)
        .await?;

    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshAccessTokenResponse {
    pub access_token: String,
    pub expired_at: FormattedDateTime,
}

pub async fn refresh_access_token(
    State(users): State<UserCollection>,
    State(refresh_tokens): State<RefreshTokenCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    RefreshClaim(claim, refresh_token): RefreshClaim,
) -> Result<Json<RefreshAccessTokenResponse>, Error> {
    let model = refresh_tokens
        .get_one_by_id(claim.sub.0)
        .await?
        .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    if !verify_password(&argon, &refresh_token, &model.token) {
        tracing::warn!(token = %claim.sub.0, "refresh token hash mismatch, revoking");
        refresh_tokens
            .delete_one(bson::doc! { "_id": claim.sub }, None)
            .await?;
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    let user = users
        .find_exists_one_by_id(claim.user_id.0)
        .await?
        .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    let access_token = generate_access_token(&jwt_state, &user)?;

    Ok(Json(RefreshAccessTokenResponse {
        access_token: access_token.token,
        expired_at: access_token.expired_at.into(),
    }))
}

pub async fn profile(user: UserModel) -> Json<UserResponse> {
    Json(user.into())
}
