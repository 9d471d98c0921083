use axum::{
    extract::{Query, State},
    Json,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    billing::PeriodFields,
    error::Error,
    mongo_ext::Collection,
    util::{now, DecimalString, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{auth::UserAccess, validate_non_negative};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExpenseCategory {
    Rent,
    Utilities,
    Salaries,
    Equipment,
    Maintenance,
    Supplies,
    Marketing,
    #[default]
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rent => "Rent",
            Self::Utilities => "Utilities",
            Self::Salaries => "Salaries",
            Self::Equipment => "Equipment",
            Self::Maintenance => "Maintenance",
            Self::Supplies => "Supplies",
            Self::Marketing => "Marketing",
            Self::Other => "Other",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExpenseModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub title: String,
    pub category: ExpenseCategory,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub expense_date: bson::DateTime,
    pub period: PeriodFields,
    pub created_by: ObjectId,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct ExpenseCollection(pub Collection<ExpenseModel>);

impl std::ops::Deref for ExpenseCollection {
    type Target = Collection<ExpenseModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ExpenseQuery {
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub quarter: Option<i32>,
    pub category: Option<ExpenseCategory>,
}

impl ExpenseQuery {
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
        if let Some(category) = self.category {
            filter.insert("category", category.as_str());
        }

        filter
    }
}

impl ExpenseCollection {
    pub async fn search(&self, query: &ExpenseQuery) -> Result<Vec<ExpenseModel>, Error> {
        self.find_all(
            query.filter(),
            FindOptions::builder()
                .sort(bson::doc! { "expense_date": -1 })
                .build(),
        )
        .await
    }

    async fn find_expense(&self, id: ObjectId) -> Result<ExpenseModel, Error> {
        self.get_one_by_id(id)
            .await?
            .ok_or(Error::NoResource)
            .tap_err(|_| tracing::debug!(expense = %id, "expense not found"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExpenseResponse {
    pub id: ObjectIdString,
    pub title: String,
    pub category: ExpenseCategory,
    pub amount: DecimalString,
    pub description: String,
    pub expense_date: FormattedDateTime,
    pub period: PeriodFields,
    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<ExpenseModel> for ExpenseResponse {
    fn from(value: ExpenseModel) -> Self {
        Self {
            id: value.id.into(),
            title: value.title,
            category: value.category,
            amount: value.amount.into(),
            description: value.description,
            expense_date: value.expense_date.into(),
            period: value.period,
            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct ExpenseRequest {
    #[validate(length(min = 1, max = 124))]
    pub title: String,

    #[serde(default)]
    pub category: ExpenseCategory,

    pub amount: DecimalString,

    #[serde(default)]
    #[validate(length(max = 512))]
    pub description: String,

    /// Defaults to the time of the request.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expense_date: Option<OffsetDateTime>,
}

impl ExpenseRequest {
    fn check(&self) -> Result<(), Error> {
        self.validate()?;
        validate_non_negative(&[("amount", self.amount.0)])
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub expenses: Vec<ExpenseResponse>,
    pub total_amount: DecimalString,
}

impl From<Vec<ExpenseModel>> for IndexResponse {
    fn from(expenses: Vec<ExpenseModel>) -> Self {
        let total_amount = expenses.iter().map(|it| it.amount).sum::<Decimal>();

        Self {
            expenses: expenses.into_iter().map(Into::into).collect(),
            total_amount: total_amount.into(),
        }
    }
}

pub async fn index(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    Query(query): Query<ExpenseQuery>,
) -> Result<Json<IndexResponse>, Error> {
    user.require_admin()?;

    Ok(Json(expenses.search(&query).await?.into()))
}

pub async fn show(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<ExpenseResponse>, Error> {
    user.require_admin()?;

    Ok(Json(expenses.find_expense(id).await?.into()))
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    Json(request): Json<ExpenseRequest>,
) -> Result<Json<ExpenseResponse>, Error> {
    user.require_admin()?;
    request.check()?;

    let now = now();
    let expense_date = request.expense_date.unwrap_or(now);

    let model = ExpenseModel {
        id: ObjectId::new(),
        title: request.title,
        category: request.category,
        amount: request.amount.0,
        description: request.description,
        expense_date: expense_date.into(),
        period: PeriodFields::of(expense_date),
        created_by: user.id,
        created_at: now.into(),
        updated_at: now.into(),
    };

    tracing::debug!("creating expense {:#?}", model);
    expenses.insert_one(&model, None).await?;

    Ok(Json(model.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn update(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<ExpenseRequest>,
) -> Result<Json<ExpenseResponse>, Error> {
    user.require_admin()?;
    request.check()?;

    let expense = expenses.find_expense(id).await?;
    let expense_date = request
        .expense_date
        .unwrap_or_else(|| expense.expense_date.into());

    let expense = ExpenseModel {
        title: request.title,
        category: request.category,
        amount: request.amount.0,
        description: request.description,
        expense_date: expense_date.into(),
        period: PeriodFields::of(expense_date),
        updated_at: now().into(),
        ..expense
    };

    expenses
        .update_one(
            bson::doc! { "_id": id },
            bson::doc! { "$set": bson::to_document(&expense)? },
            None,
        )
        .await?;

    Ok(Json(expense.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<(), Error> {
    user.require_admin()?;

    let result = expenses.delete_one(bson::doc! { "_id": id }, None).await?;
    if result.deleted_count == 0 {
        return Err(Error::NoResource);
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Query, Json};
    use time::macros::datetime;

    use super::*;
    use crate::api::v1::{auth::UserRole, tests::bootstrap};

    pub fn expense_model(category: ExpenseCategory, amount: i64, at: OffsetDateTime) -> ExpenseModel {
        ExpenseModel {
            id: ObjectId::new(),
            title: category.as_str().to_string(),
            category,
            amount: Decimal::from(amount),
            description: String::new(),
            expense_date: at.into(),
            period: PeriodFields::of(at),
            created_by: ObjectId::new(),
            created_at: at.into(),
            updated_at: at.into(),
        }
    }

    fn request(amount: i64, expense_date: Option<OffsetDateTime>) -> ExpenseRequest {
        ExpenseRequest {
            title: "Treadmill belt".to_string(),
            category: ExpenseCategory::Maintenance,
            amount: DecimalString(Decimal::from(amount)),
            description: String::new(),
            expense_date,
        }
    }

    #[test]
    fn test_query_filter() {
        let query = ExpenseQuery {
            year: Some(2026),
            category: Some(ExpenseCategory::Rent),
            ..Default::default()
        };

        assert_eq!(
            query.filter(),
            bson::doc! { "period.year": 2026, "category": "Rent" }
        );
    }

    #[test]
    fn test_request_check() {
        assert!(request(1200, None).check().is_ok());
        assert_matches!(request(-1, None).check(), Err(Error::ValidationError(_)));

        let mut untitled = request(1200, None);
        untitled.title = String::new();
        assert_matches!(untitled.check(), Err(Error::ValidationError(_)));
    }

    #[test]
    fn test_request_reads_rfc3339_date() {
        let request: ExpenseRequest = serde_json::from_value(serde_json::json!({
            "title": "Electricity",
            "category": "Utilities",
            "amount": "8400.50",
            "expense_date": "2026-02-10T00:00:00Z",
        }))
        .unwrap();

        assert_eq!(request.category, ExpenseCategory::Utilities);
        assert_eq!(request.expense_date, Some(datetime!(2026-02-10 00:00 UTC)));
        assert_eq!(request.amount.0, "8400.50".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn test_crud_recomputes_period() {
        let bootstrap = bootstrap().await;

        let Json(expense) = create(
            bootstrap.expense_collection(),
            bootstrap.user_access(),
            Json(request(1200, Some(datetime!(2026-02-10 00:00 UTC)))),
        )
        .await
        .unwrap();
        assert_eq!(expense.period.month, 2);

        let Json(updated) = update(
            bootstrap.expense_collection(),
            bootstrap.user_access(),
            PathObjectId(expense.id.0),
            Json(request(1500, Some(datetime!(2026-07-01 00:00 UTC)))),
        )
        .await
        .unwrap();
        assert_eq!(updated.period.quarter, 3);
        assert_eq!(updated.amount.0, Decimal::from(1500));

        let Json(index) = index(
            bootstrap.expense_collection(),
            bootstrap.user_access(),
            Query(ExpenseQuery {
                year: Some(2026),
                month: Some(7),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(index.expenses.len(), 1);

        let receptionist = bootstrap
            .derive("desk@gym.test", "password", UserRole::Receptionist)
            .await;
        let err = delete(
            receptionist.expense_collection(),
            receptionist.user_access(),
            PathObjectId(expense.id.0),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);
    }
}
