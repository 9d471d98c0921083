use axum::{
    extract::{Query, State},
    Json,
};
use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::{exists_filter, Collection},
    util::{now, DecimalString, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{auth::UserAccess, validate_non_negative};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    /// Shown to users and copied onto memberships as the plan type.
    pub name: String,
    pub description: String,

    pub price: Decimal,
    pub duration_days: i64,
    pub registration_fee: Decimal,
    pub active: bool,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
    #[serde(default)]
    pub deleted_at: Option<bson::DateTime>,
}

#[derive(Clone)]
pub struct PlanCollection(pub Collection<PlanModel>);

impl std::ops::Deref for PlanCollection {
    type Target = Collection<PlanModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PlanCollection {
    pub async fn find_plan(&self, id: ObjectId) -> Result<PlanModel, Error> {
        self.find_exists_one_by_id(id)
            .await?
            .ok_or(Error::NoResource)
            .tap_err(|_| tracing::debug!(plan = %id, "plan not found"))
    }

    async fn ensure_unique_name(&self, name: &str, except: Option<ObjectId>) -> Result<(), Error> {
        let mut filter = exists_filter(bson::doc! { "name": name });
        if let Some(id) = except {
            filter.insert("_id", bson::doc! { "$ne": id });
        }

        if self.count_documents(filter, None).await? > 0 {
            return Err(Error::MustUniqueError("name".to_string()));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanResponse {
    pub id: ObjectIdString,
    pub name: String,
    pub description: String,
    pub price: DecimalString,
    pub duration_days: i64,
    pub registration_fee: DecimalString,
    pub active: bool,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<PlanModel> for PlanResponse {
    fn from(value: PlanModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            description: value.description,
            price: value.price.into(),
            duration_days: value.duration_days,
            registration_fee: value.registration_fee.into(),
            active: value.active,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct IndexQuery {
    pub active: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub plans: Vec<PlanResponse>,
}

/// Cheapest first. Prices are stored as decimal strings, so this cannot be a
/// database sort.
fn sort_by_price(plans: &mut [PlanModel]) {
    plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
}

pub async fn index(
    State(plans): State<PlanCollection>,
    _user: UserAccess,
    Query(query): Query<IndexQuery>,
) -> Result<Json<IndexResponse>, Error> {
    let mut filter = bson::doc! {};
    if let Some(active) = query.active {
        filter.insert("active", active);
    }

    let mut plans = plans.find_exists(filter, None).await?;
    sort_by_price(&mut plans);

    Ok(Json(IndexResponse {
        plans: plans.into_iter().map(Into::into).collect(),
    }))
}

pub async fn show(
    State(plans): State<PlanCollection>,
    _user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<PlanResponse>, Error> {
    Ok(Json(plans.find_plan(id).await?.into()))
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct PlanRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    #[serde(default)]
    #[validate(length(max = 512))]
    pub description: String,

    pub price: DecimalString,

    #[validate(range(min = 1, max = 3660))]
    pub duration_days: i64,

    #[serde(default)]
    pub registration_fee: DecimalString,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl PlanRequest {
    fn check(&self) -> Result<(), Error> {
        self.validate()?;
        validate_non_negative(&[
            ("price", self.price.0),
            ("registration_fee", self.registration_fee.0),
        ])
    }
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(plans): State<PlanCollection>,
    user: UserAccess,
    Json(request): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, Error> {
    user.require_admin()?;
    request.check()?;
    plans.ensure_unique_name(&request.name, None).await?;

    let model = PlanModel {
        id: ObjectId::new(),
        name: request.name,
        description: request.description,
        price: request.price.0,
        duration_days: request.duration_days,
        registration_fee: request.registration_fee.0,
        active: request.active,
        created_at: now().into(),
        updated_at: now().into(),
        deleted_at: None,
    };

    tracing::debug!("creating plan {:#?}", model);
    plans.insert_one(&model, None).await?;

    Ok(Json(model.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn update(
    State(plans): State<PlanCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, Error> {
    user.require_admin()?;
    request.check()?;

    let plan = plans.find_plan(id).await?;
    if plan.name != request.name {
        plans.ensure_unique_name(&request.name, Some(id)).await?;
    }

    let plan = PlanModel {
        name: request.name,
        description: request.description,
        price: request.price.0,
        duration_days: request.duration_days,
        registration_fee: request.registration_fee.0,
        active: request.active,
        updated_at: now().into(),
        ..plan
    };

    plans
        .update_exists_one_by_id(id, bson::doc! { "$set": bson::to_document(&plan)? })
        .await?;

    Ok(Json(plan.into()))
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(plans): State<PlanCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<(), Error> {
    user.require_admin()?;

    plans.find_plan(id).await?;
    plans.soft_delete_one_by_id(id).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Query, Json};
    use rust_decimal::Decimal;

    use crate::{
        api::v1::{auth::UserRole, membership::tests::plan_model, tests::bootstrap},
        error::Error,
        util::{DecimalString, PathObjectId},
    };

    fn request(name: &str, price: i64) -> super::PlanRequest {
        super::PlanRequest {
            name: name.to_string(),
            description: String::new(),
            price: DecimalString(Decimal::from(price)),
            duration_days: 30,
            registration_fee: DecimalString(Decimal::from(1000)),
            active: true,
        }
    }

    #[test]
    fn test_request_check() {
        assert!(request("Monthly", 3000).check().is_ok());
        assert_matches!(
            request("Monthly", -1).check(),
            Err(Error::ValidationError(_))
        );

        let mut zero_days = request("Monthly", 3000);
        zero_days.duration_days = 0;
        assert_matches!(zero_days.check(), Err(Error::ValidationError(_)));
    }

    #[test]
    fn test_plans_sort_by_numeric_price() {
        let mut plans = vec![
            plan_model(30000, 365),
            plan_model(4000, 30),
            plan_model(12500, 90),
        ];
        assert_eq!(
            bson::to_document(&plans[0]).unwrap().get("price"),
            Some(&bson::Bson::String("30000".to_string()))
        );

        super::sort_by_price(&mut plans);

        let prices: Vec<_> = plans.iter().map(|it| it.price).collect();
        assert_eq!(
            prices,
            vec![
                Decimal::from(4000),
                Decimal::from(12500),
                Decimal::from(30000)
            ]
        );
    }

    #[tokio::test]
    async fn test_index_lists_cheapest_first() {
        let bootstrap = bootstrap().await;

        for (name, price) in [("Yearly", 30000), ("Monthly", 4000), ("Quarterly", 12500)] {
            super::create(
                bootstrap.plan_collection(),
                bootstrap.user_access(),
                Json(request(name, price)),
            )
            .await
            .unwrap();
        }

        let Json(index) = super::index(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            Query(Default::default()),
        )
        .await
        .unwrap();

        let names: Vec<_> = index.plans.iter().map(|it| it.name.as_str()).collect();
        assert_eq!(names, vec!["Monthly", "Quarterly", "Yearly"]);
    }

    #[tokio::test]
    async fn test_crud() {
        let bootstrap = bootstrap().await;

        let Json(plan) = super::create(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            Json(request("Monthly", 3000)),
        )
        .await
        .unwrap();

        let err = super::create(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            Json(request("Monthly", 3500)),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(name) if name == "name");

        let Json(updated) = super::update(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            PathObjectId(plan.id.0),
            Json(request("Monthly", 3500)),
        )
        .await
        .unwrap();
        assert_eq!(updated.price.0, Decimal::from(3500));

        super::delete(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            PathObjectId(plan.id.0),
        )
        .await
        .unwrap();

        let Json(index) = super::index(
            bootstrap.plan_collection(),
            bootstrap.user_access(),
            Query(Default::default()),
        )
        .await
        .unwrap();
        assert!(index.plans.is_empty());
    }

    #[tokio::test]
    async fn test_receptionist_cannot_manage_plans() {
        let bootstrap = bootstrap().await;
        let receptionist = bootstrap
            .derive("desk@gym.test", "password", UserRole::Receptionist)
            .await;

        let err = super::create(
            receptionist.plan_collection(),
            receptionist.user_access(),
            Json(request("Monthly", 3000)),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);
    }
}
