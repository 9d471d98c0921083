use argon2::Argon2;
use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    Json,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    cloudinary::CloudinaryClient,
    error::Error,
    mongo_ext::exists_filter,
    util::{hash_password, now, PathObjectId},
};

use super::auth::{
    create_user, ensure_unique_email, CreateUserRequest, Gender, UserAccess, UserCollection,
    UserModel, UserResponse, UserRole,
};

#[derive(Deserialize, Debug, Default, Clone)]
pub struct IndexQuery {
    pub role: Option<UserRole>,
    pub search: Option<String>,
}

fn escape_regex(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl IndexQuery {
    pub fn filter(&self) -> Document {
        let mut filter = bson::doc! {};

        if let Some(role) = self.role {
            filter.insert("role", role.as_str());
        }

        if let Some(search) = self.search.as_deref().map(str::trim).filter(|it| !it.is_empty()) {
            let pattern = escape_regex(search);
            let fields = ["name", "email", "phone", "cnic"]
                .into_iter()
                .map(|field| {
                    let mut condition = Document::new();
                    condition.insert(
                        field,
                        bson::doc! { "$regex": pattern.as_str(), "$options": "i" },
                    );
                    condition
                })
                .collect::<Vec<_>>();
            filter.insert("$or", fields);
        }

        exists_filter(filter)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexResponse {
    pub users: Vec<UserResponse>,
}

pub async fn index(
    State(users): State<UserCollection>,
    user: UserAccess,
    Query(query): Query<IndexQuery>,
) -> Result<Json<IndexResponse>, Error> {
    user.require_staff()?;

    let users = users
        .find_all(
            query.filter(),
            FindOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await?;

    Ok(Json(IndexResponse {
        users: users.into_iter().map(Into::into).collect(),
    }))
}

async fn find_user(users: &UserCollection, id: ObjectId) -> Result<UserModel, Error> {
    users
        .find_exists_one_by_id(id)
        .await?
        .ok_or(Error::NoResource)
        .tap_err(|_| tracing::debug!(user = %id, "user not found"))
}

pub async fn show(
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<UserResponse>, Error> {
    user.require_self_or_staff(id)?;

    Ok(Json(find_user(&users, id).await?.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccountRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub phone: Option<String>,
    pub cnic: Option<String>,
    pub gender: Option<Gender>,
    pub address: Option<String>,
    #[serde(default)]
    pub role: UserRole,
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    user: UserAccess,
    Json(request): Json<AccountRequest>,
) -> Result<Json<UserResponse>, Error> {
    user.require_staff()?;
    if request.role != UserRole::Customer {
        user.require_admin()?;
    }

    let model = create_user(
        users,
        argon,
        CreateUserRequest {
            name: request.name,
            email: request.email,
            password: request.password,
            confirm_password: request.confirm_password,
            phone: request.phone,
            cnic: request.cnic,
            gender: request.gender,
            address: request.address,
            role: request.role,
        },
    )
    .await?;

    Ok(Json(model.into()))
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: Option<String>,

    #[validate(email)]
    pub email: Option<String>,

    #[validate(length(min = 8, max = 64))]
    pub password: Option<String>,

    #[validate(must_match = "password")]
    pub confirm_password: Option<String>,

    #[validate(length(min = 7, max = 20))]
    pub phone: Option<String>,

    #[validate(length(min = 13, max = 15))]
    pub cnic: Option<String>,

    pub gender: Option<Gender>,

    #[validate(length(max = 256))]
    pub address: Option<String>,

    pub role: Option<UserRole>,
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn update(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UserResponse>, Error> {
    request.validate()?;
    user.require_self_or_staff(id)?;

    let account = find_user(&users, id).await?;
    user.require_can_manage(&account)?;

    let mut set = bson::doc! { "updated_at": bson::DateTime::from(now()) };

    if let Some(role) = request.role.filter(|it| *it != account.role) {
        user.require_admin()?;
        set.insert("role", role.as_str());
    }
    if let Some(email) = request.email.filter(|it| *it != account.email) {
        ensure_unique_email(&users, &email).await?;
        set.insert("email", email);
    }
    if let Some(password) = &request.password {
        set.insert("password", hash_password(&argon, password)?);
    }
    if let Some(name) = request.name {
        set.insert("name", name);
    }
    if let Some(phone) = request.phone {
        set.insert("phone", phone);
    }
    if let Some(cnic) = request.cnic {
        set.insert("cnic", cnic);
    }
    if let Some(gender) = request.gender {
        set.insert("gender", gender.as_str());
    }
    if let Some(address) = request.address {
        set.insert("address", address);
    }

    users
        .update_exists_one_by_id(id, bson::doc! { "$set": set })
        .await?;

    Ok(Json(find_user(&users, id).await?.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<(), Error> {
    user.require_admin()?;
    if user.id == id {
        return Err(Error::CustomStr(
            StatusCode::UNPROCESSABLE_ENTITY,
            "cannot delete your own account",
        ));
    }

    find_user(&users, id).await?;
    users.soft_delete_one_by_id(id).await?;

    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageResponse {
    pub user: UserResponse,
    pub warnings: Vec<String>,
}

struct ImageFile {
    bytes: Vec<u8>,
    file_name: String,
    content_type: String,
}

async fn read_image(mut multipart: Multipart) -> Result<ImageFile, Error> {
    while let Some(field) = multipart.next_field().await? {
        if !matches!(field.name(), Some("image") | Some("file")) {
            continue;
        }

        let file_name = field.file_name().unwrap_or("image").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await?.to_vec();

        return Ok(ImageFile {
            bytes,
            file_name,
            content_type,
        });
    }

    Err(Error::CustomStr(StatusCode::BAD_REQUEST, "no image field provided"))
}

async fn destroy_previous(
    cloudinary: &CloudinaryClient,
    public_id: Option<String>,
    warnings: &mut Vec<String>,
) {
    let Some(public_id) = public_id else {
        return;
    };

    if let Err(err) = cloudinary
        .destroy(&public_id)
        .await
        .tap_err(|err| tracing::warn!(%public_id, error = %err, "previous image not deleted"))
    {
        warnings.push(format!("image: {err}"));
    }
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn upload_image(
    State(users): State<UserCollection>,
    State(cloudinary): State<CloudinaryClient>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    multipart: Multipart,
) -> Result<Json<ImageResponse>, Error> {
    user.require_self_or_staff(id)?;
    let account = find_user(&users, id).await?;
    user.require_can_manage(&account)?;

    let image = read_image(multipart).await?;
    let uploaded = cloudinary
        .upload(image.bytes, image.file_name, &image.content_type)
        .await?;

    users
        .update_exists_one_by_id(
            id,
            bson::doc! {
                "$set": {
                    "image_url": &uploaded.secure_url,
                    "image_public_id": &uploaded.public_id,
                    "updated_at": bson::DateTime::from(now()),
                }
            },
        )
        .await?;

    let mut warnings = vec![];
    destroy_previous(&cloudinary, account.image_public_id, &mut warnings).await;

    Ok(Json(ImageResponse {
        user: find_user(&users, id).await?.into(),
        warnings,
    }))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete_image(
    State(users): State<UserCollection>,
    State(cloudinary): State<CloudinaryClient>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<ImageResponse>, Error> {
    user.require_self_or_staff(id)?;
    let account = find_user(&users, id).await?;
    user.require_can_manage(&account)?;

    if let Some(public_id) = &account.image_public_id {
        cloudinary.destroy(public_id).await?;
    }

    users
        .update_exists_one_by_id(
            id,
            bson::doc! {
                "$set": {
                    "image_url": bson::Bson::Null,
                    "image_public_id": bson::Bson::Null,
                    "updated_at": bson::DateTime::from(now()),
                }
            },
        )
        .await?;

    Ok(Json(ImageResponse {
        user: find_user(&users, id).await?.into(),
        warnings: vec![],
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Query, Json};

    use super::*;
    use crate::api::v1::tests::bootstrap;

    fn account_request(email: &str, role: UserRole) -> AccountRequest {
        AccountRequest {
            name: "Member".to_string(),
            email: email.to_string(),
            password: "password".to_string(),
            confirm_password: "password".to_string(),
            phone: Some("03001234567".to_string()),
            cnic: None,
            gender: Some(Gender::Female),
            address: None,
            role,
        }
    }

    #[test]
    fn test_search_filter() {
        let query = IndexQuery {
            role: Some(UserRole::Customer),
            search: Some(" a.b ".to_string()),
        };

        assert_eq!(
            query.filter(),
            bson::doc! {
                "role": "Customer",
                "$or": [
                    { "name": { "$regex": "a\\.b", "$options": "i" } },
                    { "email": { "$regex": "a\\.b", "$options": "i" } },
                    { "phone": { "$regex": "a\\.b", "$options": "i" } },
                    { "cnic": { "$regex": "a\\.b", "$options": "i" } },
                ],
                "deleted_at": bson::Bson::Null,
            }
        );
    }

    #[test]
    fn test_blank_search_is_ignored() {
        let query = IndexQuery {
            role: None,
            search: Some("   ".to_string()),
        };

        assert_eq!(query.filter(), exists_filter(None));
    }

    #[test]
    fn test_update_request_validation() {
        let request = UpdateRequest {
            password: Some("password".to_string()),
            confirm_password: Some("other".to_string()),
            ..Default::default()
        };
        assert!(request.validate().is_err());

        let request = UpdateRequest {
            email: Some("member@gym.test".to_string()),
            phone: Some("03001234567".to_string()),
            ..Default::default()
        };
        assert!(request.validate().is_ok());
    }

    #[tokio::test]
    async fn test_receptionist_creates_customers_only() {
        let bootstrap = bootstrap().await;
        let receptionist = bootstrap
            .derive("desk@gym.test", "password", UserRole::Receptionist)
            .await;

        let Json(customer) = create(
            receptionist.user_collection(),
            receptionist.argon(),
            receptionist.user_access(),
            Json(account_request("member@gym.test", UserRole::Customer)),
        )
        .await
        .unwrap();
        assert_eq!(customer.role, UserRole::Customer);

        let err = create(
            receptionist.user_collection(),
            receptionist.argon(),
            receptionist.user_access(),
            Json(account_request("admin2@gym.test", UserRole::Admin)),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        let err = update(
            receptionist.user_collection(),
            receptionist.argon(),
            receptionist.user_access(),
            PathObjectId(customer.id.0),
            Json(UpdateRequest {
                role: Some(UserRole::Admin),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        let Json(index) = index(
            receptionist.user_collection(),
            receptionist.user_access(),
            Query(IndexQuery {
                role: Some(UserRole::Customer),
                search: Some("MEMBER@".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(index.users.len(), 1);
    }

    #[tokio::test]
    async fn test_receptionist_cannot_edit_admin() {
        let bootstrap = bootstrap().await;
        let receptionist = bootstrap
            .derive("desk@gym.test", "password", UserRole::Receptionist)
            .await;

        let err = update(
            receptionist.user_collection(),
            receptionist.argon(),
            receptionist.user_access(),
            PathObjectId(bootstrap.user_id()),
            Json(UpdateRequest {
                email: Some("taken-over@gym.test".to_string()),
                password: Some("new-password".to_string()),
                confirm_password: Some("new-password".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        let Json(admin) = show(
            bootstrap.user_collection(),
            bootstrap.user_access(),
            PathObjectId(bootstrap.user_id()),
        )
        .await
        .unwrap();
        assert_eq!(admin.email, "admin@gym.test");

        // own profile stays editable
        let Json(updated) = update(
            receptionist.user_collection(),
            receptionist.argon(),
            receptionist.user_access(),
            PathObjectId(receptionist.user_id()),
            Json(UpdateRequest {
                name: Some("Front Desk".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "Front Desk");
    }

    #[tokio::test]
    async fn test_customer_updates_own_profile_only() {
        let bootstrap = bootstrap().await;
        let customer = bootstrap
            .derive("member@gym.test", "password", UserRole::Customer)
            .await;

        let Json(updated) = update(
            customer.user_collection(),
            customer.argon(),
            customer.user_access(),
            PathObjectId(customer.user_id()),
            Json(UpdateRequest {
                address: Some("Street 1".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.address.as_deref(), Some("Street 1"));

        let err = show(
            customer.user_collection(),
            customer.user_access(),
            PathObjectId(bootstrap.user_id()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        delete(
            bootstrap.user_collection(),
            bootstrap.user_access(),
            PathObjectId(customer.user_id()),
        )
        .await
        .unwrap();

        let err = show(
            bootstrap.user_collection(),
            bootstrap.user_access(),
            PathObjectId(customer.user_id()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NoResource);
    }
}
