use axum::{
    extract::{Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::{FindOneOptions, FindOptions};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    billing::{self, AmountBreakdown, RECEIPTS_PER_USER},
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{UserAccess, UserModel},
    membership::MembershipModel,
    payment::{PaymentMethod, PaymentModel},
};

/// Everything needed to print a receipt, copied at payment time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub receipt_number: String,

    pub user_id: ObjectId,
    pub user_name: String,
    pub user_email: String,
    #[serde(default)]
    pub user_phone: Option<String>,

    pub membership_id: ObjectId,
    pub plan_type: String,
    pub amounts: AmountBreakdown,
    pub start_date: bson::DateTime,
    pub end_date: bson::DateTime,

    pub payment_id: ObjectId,
    pub transaction_id: String,
    pub method: PaymentMethod,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct ReceiptCollection(pub Collection<ReceiptModel>);

impl std::ops::Deref for ReceiptCollection {
    type Target = Collection<ReceiptModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn new_receipt(
    user: &UserModel,
    membership: &MembershipModel,
    payment: &PaymentModel,
    now: OffsetDateTime,
) -> ReceiptModel {
    ReceiptModel {
        id: ObjectId::new(),
        receipt_number: billing::generate_receipt_number(now),
        user_id: user.id,
        user_name: user.name.clone(),
        user_email: user.email.clone(),
        user_phone: user.phone.clone(),
        membership_id: membership.id,
        plan_type: membership.plan_type.clone(),
        amounts: membership.amounts,
        start_date: membership.start_date,
        end_date: membership.end_date,
        payment_id: payment.id,
        transaction_id: payment.transaction_id.clone(),
        method: payment.method,
        created_at: now.into(),
        updated_at: now.into(),
    }
}

impl ReceiptCollection {
    /// Inserts the receipt then trims the user's receipts to the newest five.
    ///
    /// Read, sort and delete run as separate calls, so concurrent inserts for the
    /// same user may briefly leave more than five behind.
    pub async fn issue(&self, receipt: &ReceiptModel) -> Result<Vec<ObjectId>, Error> {
        self.insert_one(receipt, None).await?;

        let existing = self
            .find_all(bson::doc! { "user_id": receipt.user_id }, None)
            .await?
            .into_iter()
            .map(|it| (it.id, OffsetDateTime::from(it.created_at)))
            .collect::<Vec<_>>();

        let evicted = billing::receipts_to_evict(existing, RECEIPTS_PER_USER);

        if !evicted.is_empty() {
            self.delete_many(bson::doc! { "_id": { "$in": evicted.clone() } }, None)
                .await?;
            tracing::debug!(user = %receipt.user_id, evicted = evicted.len(), "evicted old receipts");
        }

        Ok(evicted)
    }

    pub async fn latest_for_membership(
        &self,
        membership_id: ObjectId,
    ) -> Result<Option<ReceiptModel>, Error> {
        self.find_one(
            bson::doc! { "membership_id": membership_id },
            FindOneOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await
        .map_err(Into::into)
    }

    pub async fn for_user(&self, user_id: Option<ObjectId>) -> Result<Vec<ReceiptModel>, Error> {
        let filter = user_id.map(|it| bson::doc! { "user_id": it });

        self.find_all(
            filter,
            FindOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptResponse {
    pub id: ObjectIdString,
    pub receipt_number: String,
    pub user_id: ObjectIdString,
    pub user_name: String,
    pub user_email: String,
    pub user_phone: Option<String>,
    pub membership_id: ObjectIdString,
    pub plan_type: String,
    pub amounts: AmountBreakdown,
    pub start_date: FormattedDateTime,
    pub end_date: FormattedDateTime,
    pub payment_id: ObjectIdString,
    pub transaction_id: String,
    pub method: PaymentMethod,
    pub created_at: FormattedDateTime,
}

impl From<ReceiptModel> for ReceiptResponse {
    fn from(value: ReceiptModel) -> Self {
        Self {
            id: value.id.into(),
            receipt_number: value.receipt_number,
            user_id: value.user_id.into(),
            user_name: value.user_name,
            user_email: value.user_email,
            user_phone: value.user_phone,
            membership_id: value.membership_id.into(),
            plan_type: value.plan_type,
            amounts: value.amounts,
            start_date: value.start_date.into(),
            end_date: value.end_date.into(),
            payment_id: value.payment_id.into(),
            transaction_id: value.transaction_id,
            method: value.method,
            created_at: value.created_at.into(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ReceiptQuery {
    pub user_id: Option<ObjectIdString>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub receipts: Vec<ReceiptResponse>,
}

pub async fn index(
    State(receipts): State<ReceiptCollection>,
    user: UserAccess,
    Query(query): Query<ReceiptQuery>,
) -> Result<Json<IndexResponse>, Error> {
    user.require_staff()?;

    let receipts = receipts.for_user(query.user_id.map(Into::into)).await?;

    Ok(Json(IndexResponse {
        receipts: receipts.into_iter().map(Into::into).collect(),
    }))
}

pub async fn mine(
    State(receipts): State<ReceiptCollection>,
    user: UserAccess,
) -> Result<Json<IndexResponse>, Error> {
    let receipts = receipts.for_user(Some(user.id)).await?;

    Ok(Json(IndexResponse {
        receipts: receipts.into_iter().map(Into::into).collect(),
    }))
}

pub async fn show(
    State(receipts): State<ReceiptCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<ReceiptResponse>, Error> {
    let receipt = receipts.get_one_by_id(id).await?.ok_or(Error::NoResource)?;
    user.require_self_or_staff(receipt.user_id)?;

    Ok(Json(receipt.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(receipts): State<ReceiptCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<(), Error> {
    user.require_admin()?;

    let result = receipts.delete_one(bson::doc! { "_id": id }, None).await?;
    if result.deleted_count == 0 {
        return Err(Error::NoResource);
    }

    Ok(())
}
