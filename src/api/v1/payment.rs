use axum::{
    extract::{Query, State},
    Json,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    app::AppState,
    billing::PeriodFields,
    config::MAX_RETENTION_MONTHS,
    error::Error,
    mongo_ext::Collection,
    util::{now, DecimalString, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::auth::{UserAccess, UserModel};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
    BankTransfer,
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "Cash",
            Self::Card => "Card",
            Self::BankTransfer => "BankTransfer",
            Self::Online => "Online",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    pub membership_id: ObjectId,

    pub amount: Decimal,
    pub plan_type: String,
    pub transaction_id: String,
    pub method: PaymentMethod,
    pub paid_at: bson::DateTime,

    /// Stamped from `paid_at` so reports can filter without date math.
    pub period: PeriodFields,

    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub archived_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct PaymentCollection(pub Collection<PaymentModel>);

impl std::ops::Deref for PaymentCollection {
    type Target = Collection<PaymentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentResponse {
    pub id: ObjectIdString,
    pub user_id: ObjectIdString,
    pub membership_id: ObjectIdString,
    pub amount: DecimalString,
    pub plan_type: String,
    pub transaction_id: String,
    pub method: PaymentMethod,
    pub paid_at: FormattedDateTime,
    pub period: PeriodFields,
    pub is_archived: bool,
    pub created_at: FormattedDateTime,
}

impl From<PaymentModel> for PaymentResponse {
    fn from(value: PaymentModel) -> Self {
        Self {
            id: value.id.into(),
            user_id: value.user_id.into(),
            membership_id: value.membership_id.into(),
            amount: value.amount.into(),
            plan_type: value.plan_type,
            transaction_id: value.transaction_id,
            method: value.method,
            paid_at: value.paid_at.into(),
            period: value.period,
            is_archived: value.is_archived,
            created_at: value.created_at.into(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PaymentQuery {
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub quarter: Option<i32>,
    pub plan_type: Option<String>,
    pub user_id: Option<ObjectIdString>,
    #[serde(default)]
    pub include_archived: bool,
}

impl PaymentQuery {
    pub fn filter(&self) -> Document {
        let mut filter = bson::doc! {};

        if let Some(year) = self.year {
            filter.insert("period.year", year);
        }
        if let Some(month) = self.month {
            filter.insert("period.month", month);
        }
        if let Some(quarter) = self.quarter {
            filter.insert("period.quarter", quarter);
        }
        if let Some(plan_type) = &self.plan_type {
            filter.insert("plan_type", plan_type.as_str());
        }
        if let Some(user_id) = self.user_id {
            filter.insert("user_id", user_id.0);
        }
        if !self.include_archived {
            filter.insert("is_archived", bson::doc! { "$ne": true });
        }

        filter
    }
}

impl PaymentCollection {
    pub async fn search(&self, query: &PaymentQuery) -> Result<Vec<PaymentModel>, Error> {
        self.find_all(
            query.filter(),
            FindOptions::builder()
                .sort(bson::doc! { "paid_at": -1 })
                .build(),
        )
        .await
    }

    pub async fn latest_for_membership(
        &self,
        membership_id: ObjectId,
    ) -> Result<Option<PaymentModel>, Error> {
        self.find_one(
            bson::doc! { "membership_id": membership_id },
            mongodb::options::FindOneOptions::builder()
                .sort(bson::doc! { "paid_at": -1 })
                .build(),
        )
        .await
        .map_err(Into::into)
    }
}

/// Cut-off before which payments get archived.
pub fn archive_cutoff(now: OffsetDateTime, retention_months: i64) -> OffsetDateTime {
    // calendar months are approximated as 30 days
    now - Duration::days(retention_months.clamp(0, MAX_RETENTION_MONTHS) * 30)
}

pub fn new_payment(
    user: &UserModel,
    membership_id: ObjectId,
    plan_type: &str,
    amount: Decimal,
    method: PaymentMethod,
    paid_at: OffsetDateTime,
) -> PaymentModel {
    PaymentModel {
        id: ObjectId::new(),
        user_id: user.id,
        membership_id,
        amount,
        plan_type: plan_type.to_string(),
        transaction_id: crate::billing::generate_transaction_id(paid_at),
        method,
        paid_at: paid_at.into(),
        period: PeriodFields::of(paid_at),
        is_archived: false,
        archived_at: None,
        created_at: paid_at.into(),
        updated_at: paid_at.into(),
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub payments: Vec<PaymentResponse>,
    pub total_amount: DecimalString,
}

impl From<Vec<PaymentModel>> for IndexResponse {
    fn from(payments: Vec<PaymentModel>) -> Self {
        let total_amount = payments.iter().map(|it| it.amount).sum::<Decimal>();

        Self {
            payments: payments.into_iter().map(Into::into).collect(),
            total_amount: total_amount.into(),
        }
    }
}

pub async fn index(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
    Query(query): Query<PaymentQuery>,
) -> Result<Json<IndexResponse>, Error> {
    user.require_staff()?;

    Ok(Json(payments.search(&query).await?.into()))
}

pub async fn mine(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
) -> Result<Json<IndexResponse>, Error> {
    let query = PaymentQuery {
        user_id: Some(user.id.into()),
        include_archived: true,
        ..Default::default()
    };

    Ok(Json(payments.search(&query).await?.into()))
}

pub async fn show(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<PaymentResponse>, Error> {
    let payment = payments.get_one_by_id(id).await?.ok_or(Error::NoResource)?;
    user.require_self_or_staff(payment.user_id)?;

    Ok(Json(payment.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<(), Error> {
    user.require_admin()?;

    let result = payments.delete_one(bson::doc! { "_id": id }, None).await?;
    if result.deleted_count == 0 {
        return Err(Error::NoResource);
    }

    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ArchiveResponse {
    pub archived: u64,
    pub cutoff: FormattedDateTime,
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn archive(
    State(state): State<AppState>,
    user: UserAccess,
) -> Result<Json<ArchiveResponse>, Error> {
    user.require_admin()?;

    let now = now();
    let cutoff = archive_cutoff(now, state.payment_retention_months);

    let result = state
        .payment_collection
        .update_many(
            bson::doc! {
                "paid_at": { "$lt": bson::DateTime::from(cutoff) },
                "is_archived": { "$ne": true },
            },
            bson::doc! {
                "$set": {
                    "is_archived": true,
                    "archived_at": bson::DateTime::from(now),
                    "updated_at": bson::DateTime::from(now),
                }
            },
            None,
        )
        .await?;

    tracing::info!(archived = result.modified_count, "archived old payments");

    Ok(Json(ArchiveResponse {
        archived: result.modified_count,
        cutoff: cutoff.into(),
    }))
}
