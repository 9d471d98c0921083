use axum::{
    extract::{FromRef, Query, State},
    Json,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOneOptions, FindOptions};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::{Duration, OffsetDateTime};
use validator::Validate;

use crate::{
    app::AppState,
    billing::{
        compute_amounts, days_remaining, decide_edit, renewal_window, AmountBreakdown,
        AmountInput, EditKind, MembershipStatus,
    },
    error::Error,
    mongo_ext::Collection,
    util::{now, DecimalString, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{UserAccess, UserCollection, UserModel},
    payment::{new_payment, PaymentCollection, PaymentMethod, PaymentResponse},
    plan::{PlanCollection, PlanModel},
    receipt::{new_receipt, ReceiptCollection},
    validate_non_negative,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MembershipModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    pub plan_id: ObjectId,
    pub plan_type: String,

    pub amounts: AmountBreakdown,
    pub registration_fee_applied: bool,
    pub custom_registration_fee: Decimal,
    pub discount_applied: bool,
    pub discount_amount: Decimal,
    pub payment_method: PaymentMethod,

    pub start_date: bson::DateTime,
    pub end_date: bson::DateTime,
    pub status: MembershipStatus,
    pub renewal_count: i32,
    #[serde(default)]
    pub last_renewed_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl MembershipModel {
    pub fn amount_input(&self) -> AmountInput {
        AmountInput {
            registration_fee: self.registration_fee_applied,
            custom_registration_fee: self.custom_registration_fee,
            discount: self.discount_applied,
            discount_amount: self.discount_amount,
        }
    }

    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        days_remaining(self.end_date.into(), now)
    }

    fn with_plan(
        self,
        plan: &PlanModel,
        input: AmountInput,
        method: PaymentMethod,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            plan_id: plan.id,
            plan_type: plan.name.clone(),
            amounts: compute_amounts(plan.price, &input),
            registration_fee_applied: input.registration_fee,
            custom_registration_fee: input.custom_registration_fee,
            discount_applied: input.discount,
            discount_amount: input.discount_amount,
            payment_method: method,
            updated_at: now.into(),
            ..self
        }
    }

    /// Restarts the validity window at `now` for the plan's duration.
    fn activated(self, plan: &PlanModel, now: OffsetDateTime) -> Self {
        let (start, end) = renewal_window(now, plan.duration_days);

        Self {
            start_date: start.into(),
            end_date: end.into(),
            status: MembershipStatus::Active,
            ..self
        }
    }
}

/// Applies an edit to a membership. Fewer than seven days left makes it a
/// renewal with a fresh window; otherwise only plan and amount fields change.
pub fn edit_membership(
    membership: &MembershipModel,
    plan: &PlanModel,
    input: AmountInput,
    method: PaymentMethod,
    now: OffsetDateTime,
) -> (EditKind, MembershipModel) {
    let kind = decide_edit(membership.end_date.into(), now);
    let edited = membership.clone().with_plan(plan, input, method, now);

    let edited = match kind {
        EditKind::Renewal => MembershipModel {
            renewal_count: membership.renewal_count + 1,
            last_renewed_at: Some(now.into()),
            ..edited.activated(plan, now)
        },
        EditKind::UpdateOnly => edited,
    };

    (kind, edited)
}

#[derive(Clone)]
pub struct MembershipCollection(pub Collection<MembershipModel>);

impl std::ops::Deref for MembershipCollection {
    type Target = Collection<MembershipModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MembershipCollection {
    pub async fn find_membership(&self, id: ObjectId) -> Result<MembershipModel, Error> {
        self.get_one_by_id(id).await?.ok_or(Error::NoResource)
    }

    pub async fn latest_for_user(&self, user_id: ObjectId) -> Result<Option<MembershipModel>, Error> {
        self.find_one(
            bson::doc! { "user_id": user_id },
            FindOneOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await
        .map_err(Into::into)
    }

    async fn save(&self, membership: &MembershipModel) -> Result<(), Error> {
        self.update_one(
            bson::doc! { "_id": membership.id },
            bson::doc! { "$set": bson::to_document(membership)? },
            None,
        )
        .await?;

        Ok(())
    }
}

/// Copy of the latest membership kept on the user document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MembershipSummary {
    pub membership_id: ObjectId,
    pub plan_type: String,
    pub status: MembershipStatus,
    pub start_date: bson::DateTime,
    pub end_date: bson::DateTime,
    pub total_amount: Decimal,
    pub renewal_count: i32,
}

impl From<&MembershipModel> for MembershipSummary {
    fn from(value: &MembershipModel) -> Self {
        Self {
            membership_id: value.id,
            plan_type: value.plan_type.clone(),
            status: value.status,
            start_date: value.start_date,
            end_date: value.end_date,
            total_amount: value.amounts.total_amount,
            renewal_count: value.renewal_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MembershipSummaryResponse {
    pub membership_id: ObjectIdString,
    pub plan_type: String,
    pub status: MembershipStatus,
    pub start_date: FormattedDateTime,
    pub end_date: FormattedDateTime,
    pub total_amount: DecimalString,
    pub renewal_count: i32,
}

impl From<MembershipSummary> for MembershipSummaryResponse {
    fn from(value: MembershipSummary) -> Self {
        Self {
            membership_id: value.membership_id.into(),
            plan_type: value.plan_type,
            status: value.status,
            start_date: value.start_date.into(),
            end_date: value.end_date.into(),
            total_amount: value.total_amount.into(),
            renewal_count: value.renewal_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MembershipResponse {
    pub id: ObjectIdString,
    pub user_id: ObjectIdString,
    pub plan_id: ObjectIdString,
    pub plan_type: String,
    pub amounts: AmountBreakdown,
    pub registration_fee_applied: bool,
    pub discount_applied: bool,
    pub payment_method: PaymentMethod,
    pub start_date: FormattedDateTime,
    pub end_date: FormattedDateTime,
    pub status: MembershipStatus,
    pub renewal_count: i32,
    pub last_renewed_at: Option<FormattedDateTime>,
    pub days_remaining: i64,
    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl MembershipResponse {
    pub fn at(value: MembershipModel, now: OffsetDateTime) -> Self {
        Self {
            days_remaining: value.days_remaining(now),
            id: value.id.into(),
            user_id: value.user_id.into(),
            plan_id: value.plan_id.into(),
            plan_type: value.plan_type,
            amounts: value.amounts,
            registration_fee_applied: value.registration_fee_applied,
            discount_applied: value.discount_applied,
            payment_method: value.payment_method,
            start_date: value.start_date.into(),
            end_date: value.end_date.into(),
            status: value.status,
            renewal_count: value.renewal_count,
            last_renewed_at: value.last_renewed_at.map(Into::into),
            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

/// Downstream writes that failed after the membership itself was saved.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SyncWarnings(pub Vec<String>);

impl SyncWarnings {
    pub fn note<T>(&mut self, step: &str, result: Result<T, Error>) -> Option<T> {
        result
            .tap_err(|err| tracing::warn!(step, error = %err, "downstream write failed, continuing"))
            .map_err(|err| self.0.push(format!("{step}: {err}")))
            .ok()
    }
}

/// Selects the owner whose summary `membership` may overwrite. An active
/// membership always takes the summary; any other only fills an empty one or
/// refreshes its own entry.
fn summary_filter(membership: &MembershipModel) -> Document {
    let mut filter = bson::doc! {
        "_id": membership.user_id,
        "deleted_at": null,
    };

    if membership.status != MembershipStatus::Active {
        filter.insert(
            "$or",
            bson::bson!([
                { "membership": null },
                { "membership.membership_id": membership.id },
            ]),
        );
    }

    filter
}

/// The collections a membership change fans out to.
#[derive(Clone)]
pub struct Ledger {
    pub memberships: MembershipCollection,
    pub plans: PlanCollection,
    pub payments: PaymentCollection,
    pub receipts: ReceiptCollection,
    pub users: UserCollection,
}

impl FromRef<AppState> for Ledger {
    fn from_ref(state: &AppState) -> Self {
        Self {
            memberships: state.membership_collection.clone(),
            plans: state.plan_collection.clone(),
            payments: state.payment_collection.clone(),
            receipts: state.receipt_collection.clone(),
            users: state.user_collection.clone(),
        }
    }
}

impl Ledger {
    async fn find_user(&self, id: ObjectId) -> Result<UserModel, Error> {
        self.users
            .find_exists_one_by_id(id)
            .await?
            .ok_or(Error::NoResource)
            .tap_err(|_| tracing::debug!(user = %id, "membership owner not found"))
    }

    async fn sync_user(&self, membership: &MembershipModel, warnings: &mut SyncWarnings) {
        let result = async {
            let result = self
                .users
                .update_one(
                    summary_filter(membership),
                    bson::doc! {
                        "$set": {
                            "membership": bson::to_bson(&MembershipSummary::from(membership))?,
                            "updated_at": bson::DateTime::from(now()),
                        }
                    },
                    None,
                )
                .await?;
            if result.matched_count == 0 {
                tracing::debug!(membership = %membership.id, "user summary kept");
            }
            Ok::<_, Error>(())
        }
        .await;

        warnings.note("user", result);
    }

    /// Records a payment and receipt for the membership's current amount.
    async fn settle(
        &self,
        membership: &MembershipModel,
        user: &UserModel,
        now: OffsetDateTime,
        warnings: &mut SyncWarnings,
    ) -> Option<PaymentResponse> {
        let payment = new_payment(
            user,
            membership.id,
            &membership.plan_type,
            membership.amounts.total_amount,
            membership.payment_method,
            now,
        );

        let inserted = warnings.note(
            "payment",
            self.payments
                .insert_one(&payment, None)
                .await
                .map_err(Error::from),
        );

        match inserted {
            Some(_) => {
                let receipt = new_receipt(user, membership, &payment, now);
                warnings.note("receipt", self.receipts.issue(&receipt).await);
            }
            None => warnings
                .0
                .push("receipt: skipped because the payment was not recorded".to_string()),
        }

        self.sync_user(membership, warnings).await;

        inserted.map(|_| payment.into())
    }

    /// Mirrors amount and plan edits onto the latest payment and receipt.
    async fn patch_latest_records(
        &self,
        membership: &MembershipModel,
        now: OffsetDateTime,
        warnings: &mut SyncWarnings,
    ) {
        let payment = async {
            let update = bson::doc! {
                "$set": {
                    "amount": bson::to_bson(&membership.amounts.total_amount)?,
                    "plan_type": membership.plan_type.as_str(),
                    "method": bson::to_bson(&membership.payment_method)?,
                    "updated_at": bson::DateTime::from(now),
                }
            };

            self.payments
                .find_one_and_update(
                    bson::doc! { "membership_id": membership.id },
                    update,
                    FindOneAndUpdateOptions::builder()
                        .sort(bson::doc! { "paid_at": -1 })
                        .build(),
                )
                .await
                .map_err(Error::from)
        }
        .await;
        if let Some(None) = warnings.note("payment", payment) {
            warnings.0.push("payment: no payment found for membership".to_string());
        }

        let receipt = async {
            let update = bson::doc! {
                "$set": {
                    "plan_type": membership.plan_type.as_str(),
                    "amounts": bson::to_bson(&membership.amounts)?,
                    "method": bson::to_bson(&membership.payment_method)?,
                    "updated_at": bson::DateTime::from(now),
                }
            };

            self.receipts
                .find_one_and_update(
                    bson::doc! { "membership_id": membership.id },
                    update,
                    FindOneAndUpdateOptions::builder()
                        .sort(bson::doc! { "created_at": -1 })
                        .build(),
                )
                .await
                .map_err(Error::from)
        }
        .await;
        if let Some(None) = warnings.note("receipt", receipt) {
            warnings.0.push("receipt: no receipt found for membership".to_string());
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipAction {
    Created,
    Requested,
    Approved,
    Renewed,
    Updated,
}

impl From<EditKind> for MembershipAction {
    fn from(value: EditKind) -> Self {
        match value {
            EditKind::Renewal => Self::Renewed,
            EditKind::UpdateOnly => Self::Updated,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MembershipOutcome {
    pub action: MembershipAction,
    pub membership: MembershipResponse,
    pub payment: Option<PaymentResponse>,
    pub warnings: Vec<String>,
}

/// Registration fee and discount fields as submitted by the membership form.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AmountRequest {
    #[serde(default)]
    pub registration_fee: bool,
    /// Falls back to the plan's registration fee.
    #[serde(default)]
    pub custom_registration_fee: Option<DecimalString>,
    #[serde(default)]
    pub discount: bool,
    #[serde(default)]
    pub discount_amount: Option<DecimalString>,
}

impl AmountRequest {
    pub fn resolve(&self, plan: &PlanModel) -> Result<AmountInput, Error> {
        let input = AmountInput {
            registration_fee: self.registration_fee,
            custom_registration_fee: self
                .custom_registration_fee
                .map(|it| it.0)
                .unwrap_or(plan.registration_fee),
            discount: self.discount,
            discount_amount: self.discount_amount.map(|it| it.0).unwrap_or_default(),
        };

        validate_non_negative(&[
            ("custom_registration_fee", input.custom_registration_fee),
            ("discount_amount", input.discount_amount),
        ])?;

        Ok(input)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateRequest {
    pub user_id: ObjectIdString,
    pub plan_id: ObjectIdString,
    #[serde(flatten)]
    pub amounts: AmountRequest,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Keeps the current plan when absent.
    pub plan_id: Option<ObjectIdString>,
    #[serde(flatten)]
    pub amounts: AmountRequest,
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestMembership {
    pub plan_id: ObjectIdString,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SettleRequest {
    pub payment_method: Option<PaymentMethod>,
}

async fn active_plan(plans: &PlanCollection, id: ObjectId) -> Result<PlanModel, Error> {
    let plan = plans.find_plan(id).await?;

    if !plan.active {
        return Err(Error::CustomStr(
            axum::http::StatusCode::UNPROCESSABLE_ENTITY,
            "plan is not active",
        ));
    }

    Ok(plan)
}

fn new_membership(
    user: &UserModel,
    plan: &PlanModel,
    input: AmountInput,
    method: PaymentMethod,
    status: MembershipStatus,
    now: OffsetDateTime,
) -> MembershipModel {
    let (start, end) = renewal_window(now, plan.duration_days);

    MembershipModel {
        id: ObjectId::new(),
        user_id: user.id,
        plan_id: plan.id,
        plan_type: plan.name.clone(),
        amounts: compute_amounts(plan.price, &input),
        registration_fee_applied: input.registration_fee,
        custom_registration_fee: input.custom_registration_fee,
        discount_applied: input.discount,
        discount_amount: input.discount_amount,
        payment_method: method,
        start_date: start.into(),
        end_date: end.into(),
        status,
        renewal_count: 0,
        last_renewed_at: None,
        created_at: now.into(),
        updated_at: now.into(),
    }
}

pub async fn create_membership(
    ledger: &Ledger,
    request: CreateRequest,
    now: OffsetDateTime,
) -> Result<MembershipOutcome, Error> {
    let plan = active_plan(&ledger.plans, request.plan_id.0).await?;
    let input = request.amounts.resolve(&plan)?;
    let user = ledger.find_user(request.user_id.0).await?;

    let membership = new_membership(
        &user,
        &plan,
        input,
        request.payment_method,
        MembershipStatus::Active,
        now,
    );
    ledger.memberships.insert_one(&membership, None).await?;

    let mut warnings = SyncWarnings::default();
    let payment = ledger.settle(&membership, &user, now, &mut warnings).await;

    Ok(MembershipOutcome {
        action: MembershipAction::Created,
        membership: MembershipResponse::at(membership, now),
        payment,
        warnings: warnings.0,
    })
}

pub async fn request_membership(
    ledger: &Ledger,
    user: &UserModel,
    request: RequestMembership,
    now: OffsetDateTime,
) -> Result<MembershipOutcome, Error> {
    let plan = active_plan(&ledger.plans, request.plan_id.0).await?;

    let pending = ledger
        .memberships
        .count_documents(
            bson::doc! {
                "user_id": user.id,
                "status": MembershipStatus::Pending.as_str(),
            },
            None,
        )
        .await?;
    if pending > 0 {
        return Err(Error::InvalidMembershipState("already awaiting approval"));
    }

    // first-time members pay the plan's registration fee
    let input = AmountInput {
        registration_fee: user.membership.is_none(),
        custom_registration_fee: plan.registration_fee,
        ..Default::default()
    };

    let membership = new_membership(
        user,
        &plan,
        input,
        PaymentMethod::default(),
        MembershipStatus::Pending,
        now,
    );
    ledger.memberships.insert_one(&membership, None).await?;

    let mut warnings = SyncWarnings::default();
    ledger.sync_user(&membership, &mut warnings).await;

    Ok(MembershipOutcome {
        action: MembershipAction::Requested,
        membership: MembershipResponse::at(membership, now),
        payment: None,
        warnings: warnings.0,
    })
}

pub async fn approve_membership(
    ledger: &Ledger,
    id: ObjectId,
    request: SettleRequest,
    now: OffsetDateTime,
) -> Result<MembershipOutcome, Error> {
    let membership = ledger.memberships.find_membership(id).await?;
    if membership.status != MembershipStatus::Pending {
        return Err(Error::InvalidMembershipState("not awaiting approval"));
    }

    let plan = ledger.plans.find_plan(membership.plan_id).await?;
    let user = ledger.find_user(membership.user_id).await?;

    let method = request.payment_method.unwrap_or(membership.payment_method);
    let membership = MembershipModel {
        payment_method: method,
        updated_at: now.into(),
        ..membership.activated(&plan, now)
    };
    ledger.memberships.save(&membership).await?;

    let mut warnings = SyncWarnings::default();
    let payment = ledger.settle(&membership, &user, now, &mut warnings).await;

    Ok(MembershipOutcome {
        action: MembershipAction::Approved,
        membership: MembershipResponse::at(membership, now),
        payment,
        warnings: warnings.0,
    })
}

/// Edits a membership, renewing it when it is within a week of expiry.
///
/// Membership, payment, receipt and user are written one after the other with
/// no transaction. Only the membership write is fatal; later failures are
/// reported as warnings and the documents are left to drift.
pub async fn update_existing_membership(
    ledger: &Ledger,
    id: ObjectId,
    request: UpdateRequest,
    now: OffsetDateTime,
) -> Result<MembershipOutcome, Error> {
    let membership = ledger.memberships.find_membership(id).await?;
    if membership.status == MembershipStatus::Pending {
        return Err(Error::InvalidMembershipState("awaiting approval"));
    }

    let plan_id = request.plan_id.map(|it| it.0).unwrap_or(membership.plan_id);
    let plan = ledger.plans.find_plan(plan_id).await?;
    let input = request.amounts.resolve(&plan)?;
    let user = ledger.find_user(membership.user_id).await?;
    let method = request.payment_method.unwrap_or(membership.payment_method);

    let (kind, edited) = edit_membership(&membership, &plan, input, method, now);
    tracing::debug!(membership = %id, ?kind, "editing membership");

    ledger.memberships.save(&edited).await?;

    let mut warnings = SyncWarnings::default();
    let payment = match kind {
        EditKind::Renewal => ledger.settle(&edited, &user, now, &mut warnings).await,
        EditKind::UpdateOnly => {
            ledger.patch_latest_records(&edited, now, &mut warnings).await;
            ledger.sync_user(&edited, &mut warnings).await;
            None
        }
    };

    Ok(MembershipOutcome {
        action: kind.into(),
        membership: MembershipResponse::at(edited, now),
        payment,
        warnings: warnings.0,
    })
}

pub async fn renew_membership(
    ledger: &Ledger,
    id: ObjectId,
    request: SettleRequest,
    now: OffsetDateTime,
) -> Result<MembershipOutcome, Error> {
    let membership = ledger.memberships.find_membership(id).await?;
    if membership.status == MembershipStatus::Pending {
        return Err(Error::InvalidMembershipState("awaiting approval"));
    }

    if decide_edit(membership.end_date.into(), now) == EditKind::UpdateOnly {
        return Err(Error::RenewalNotAllowed {
            days_remaining: membership.days_remaining(now),
        });
    }

    let plan = ledger.plans.find_plan(membership.plan_id).await?;
    let user = ledger.find_user(membership.user_id).await?;
    let method = request.payment_method.unwrap_or(membership.payment_method);

    let (kind, renewed) = edit_membership(&membership, &plan, membership.amount_input(), method, now);
    debug_assert_eq!(kind, EditKind::Renewal);

    ledger.memberships.save(&renewed).await?;

    let mut warnings = SyncWarnings::default();
    let payment = ledger.settle(&renewed, &user, now, &mut warnings).await;

    Ok(MembershipOutcome {
        action: MembershipAction::Renewed,
        membership: MembershipResponse::at(renewed, now),
        payment,
        warnings: warnings.0,
    })
}

/// Recomputes the status of every non-pending membership from its dates.
pub async fn refresh_statuses(ledger: &Ledger, now: OffsetDateTime) -> Result<u64, Error> {
    let memberships = ledger
        .memberships
        .find_all(
            bson::doc! { "status": { "$ne": MembershipStatus::Pending.as_str() } },
            None,
        )
        .await?;

    let mut updated = 0;

    for membership in memberships {
        let status = MembershipStatus::at(
            membership.start_date.into(),
            membership.end_date.into(),
            now,
        );
        if status == membership.status {
            continue;
        }

        ledger
            .memberships
            .update_one(
                bson::doc! { "_id": membership.id },
                bson::doc! {
                    "$set": {
                        "status": status.as_str(),
                        "updated_at": bson::DateTime::from(now),
                    }
                },
                None,
            )
            .await?;

        ledger
            .users
            .update_many(
                bson::doc! { "membership.membership_id": membership.id },
                bson::doc! { "$set": { "membership.status": status.as_str() } },
                None,
            )
            .await
            .tap_err(|err| tracing::warn!(membership = %membership.id, error = %err, "user summary not updated"))
            .ok();

        updated += 1;
    }

    tracing::info!(updated, "membership statuses refreshed");

    Ok(updated)
}

const MAX_EXPIRING_WITHIN_DAYS: i64 = 3660;

#[derive(Validate, Deserialize, Debug, Default, Clone)]
pub struct MembershipQuery {
    pub status: Option<MembershipStatus>,
    pub user_id: Option<ObjectIdString>,
    pub plan_type: Option<String>,
    /// Only memberships ending between now and this many days ahead.
    #[validate(range(min = 0, max = 3660))]
    pub expiring_within_days: Option<i64>,
}

impl MembershipQuery {
    pub fn filter(&self, now: OffsetDateTime) -> Document {
        let mut filter = bson::doc! {};

        if let Some(status) = self.status {
            filter.insert("status", status.as_str());
        }
        if let Some(user_id) = self.user_id {
            filter.insert("user_id", user_id.0);
        }
        if let Some(plan_type) = &self.plan_type {
            filter.insert("plan_type", plan_type.as_str());
        }
        if let Some(days) = self.expiring_within_days {
            let days = days.clamp(0, MAX_EXPIRING_WITHIN_DAYS);
            filter.insert(
                "end_date",
                bson::doc! {
                    "$gte": bson::DateTime::from(now),
                    "$lte": bson::DateTime::from(now + Duration::days(days)),
                },
            );
        }

        filter
    }
}

impl MembershipCollection {
    pub async fn search(
        &self,
        query: &MembershipQuery,
        now: OffsetDateTime,
    ) -> Result<Vec<MembershipModel>, Error> {
        self.find_all(
            query.filter(now),
            FindOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IndexResponse {
    pub memberships: Vec<MembershipResponse>,
}

pub async fn index(
    State(memberships): State<MembershipCollection>,
    user: UserAccess,
    Query(query): Query<MembershipQuery>,
) -> Result<Json<IndexResponse>, Error> {
    user.require_staff()?;
    query.validate()?;

    let now = now();
    let memberships = memberships.search(&query, now).await?;

    Ok(Json(IndexResponse {
        memberships: memberships
            .into_iter()
            .map(|it| MembershipResponse::at(it, now))
            .collect(),
    }))
}

pub async fn show(
    State(memberships): State<MembershipCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<MembershipResponse>, Error> {
    let membership = memberships.find_membership(id).await?;
    user.require_self_or_staff(membership.user_id)?;

    Ok(Json(MembershipResponse::at(membership, now())))
}

pub async fn mine(
    State(memberships): State<MembershipCollection>,
    user: UserAccess,
) -> Result<Json<MembershipResponse>, Error> {
    let membership = memberships
        .latest_for_user(user.id)
        .await?
        .ok_or(Error::NoResource)?;

    Ok(Json(MembershipResponse::at(membership, now())))
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(ledger): State<Ledger>,
    user: UserAccess,
    Json(request): Json<CreateRequest>,
) -> Result<Json<MembershipOutcome>, Error> {
    user.require_staff()?;

    create_membership(&ledger, request, now()).await.map(Json)
}

#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn request(
    State(ledger): State<Ledger>,
    user: UserModel,
    Json(request): Json<RequestMembership>,
) -> Result<Json<MembershipOutcome>, Error> {
    request_membership(&ledger, &user, request, now()).await.map(Json)
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn approve(
    State(ledger): State<Ledger>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<SettleRequest>,
) -> Result<Json<MembershipOutcome>, Error> {
    user.require_staff()?;

    approve_membership(&ledger, id, request, now()).await.map(Json)
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn update(
    State(ledger): State<Ledger>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<MembershipOutcome>, Error> {
    user.require_staff()?;

    update_existing_membership(&ledger, id, request, now())
        .await
        .map(Json)
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn renew(
    State(ledger): State<Ledger>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Json(request): Json<SettleRequest>,
) -> Result<Json<MembershipOutcome>, Error> {
    user.require_staff()?;

    renew_membership(&ledger, id, request, now()).await.map(Json)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeleteResponse {
    pub warnings: Vec<String>,
}

#[tracing::instrument(skip_all, fields(id = %id, user = ?user))]
pub async fn delete(
    State(ledger): State<Ledger>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<DeleteResponse>, Error> {
    user.require_admin()?;

    let result = ledger
        .memberships
        .delete_one(bson::doc! { "_id": id }, None)
        .await?;
    if result.deleted_count == 0 {
        return Err(Error::NoResource);
    }

    let mut warnings = SyncWarnings::default();
    warnings.note(
        "user",
        ledger
            .users
            .update_many(
                bson::doc! { "membership.membership_id": id },
                bson::doc! { "$set": { "membership": bson::Bson::Null } },
                None,
            )
            .await
            .map_err(Error::from),
    );

    Ok(Json(DeleteResponse {
        warnings: warnings.0,
    }))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RefreshStatusResponse {
    pub updated: u64,
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn refresh_status(
    State(ledger): State<Ledger>,
    user: UserAccess,
) -> Result<Json<RefreshStatusResponse>, Error> {
    user.require_staff()?;

    let updated = refresh_statuses(&ledger, now()).await?;

    Ok(Json(RefreshStatusResponse { updated }))
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use time::macros::datetime;

    use super::*;
    use crate::api::v1::{auth::UserRole, tests::bootstrap};

    pub fn plan_model(price: i64, duration_days: i64) -> PlanModel {
        PlanModel {
            id: ObjectId::new(),
            name: "Monthly".to_string(),
            description: String::new(),
            price: Decimal::from(price),
            duration_days,
            registration_fee: Decimal::from(1000),
            active: true,
            created_at: bson::DateTime::now(),
            updated_at: bson::DateTime::now(),
            deleted_at: None,
        }
    }

    pub fn membership_model(
        user: &UserModel,
        start: OffsetDateTime,
        duration_days: i64,
    ) -> MembershipModel {
        new_membership(
            user,
            &plan_model(3000, duration_days),
            AmountInput::default(),
            PaymentMethod::Cash,
            MembershipStatus::Active,
            start,
        )
    }

    fn member() -> UserModel {
        UserModel::new_for_test("member@gym.test", UserRole::Customer)
    }

    #[test]
    fn test_edit_renews_when_less_than_a_week_left() {
        let start = datetime!(2026-03-01 00:00 UTC);
        let membership = membership_model(&member(), start, 30);
        let now = datetime!(2026-03-26 00:00 UTC);
        let plan = plan_model(3500, 30);

        let (kind, edited) =
            edit_membership(&membership, &plan, AmountInput::default(), PaymentMethod::Card, now);

        assert_eq!(kind, EditKind::Renewal);
        assert_eq!(OffsetDateTime::from(edited.start_date), now);
        assert_eq!(
            OffsetDateTime::from(edited.end_date),
            datetime!(2026-04-25 00:00 UTC)
        );
        assert_eq!(edited.renewal_count, membership.renewal_count + 1);
        assert_eq!(edited.last_renewed_at, Some(now.into()));
        assert_eq!(edited.status, MembershipStatus::Active);
        assert_eq!(edited.amounts.total_amount, Decimal::from(3500));
        assert_eq!(edited.payment_method, PaymentMethod::Card);
    }

    #[test]
    fn test_edit_renews_expired_membership() {
        let membership = MembershipModel {
            status: MembershipStatus::Expired,
            ..membership_model(&member(), datetime!(2026-01-01 00:00 UTC), 30)
        };
        let now = datetime!(2026-03-01 00:00 UTC);

        let (kind, edited) = edit_membership(
            &membership,
            &plan_model(3000, 90),
            AmountInput::default(),
            PaymentMethod::Cash,
            now,
        );

        assert_eq!(kind, EditKind::Renewal);
        assert_eq!(
            OffsetDateTime::from(edited.end_date),
            datetime!(2026-05-30 00:00 UTC)
        );
        assert_eq!(edited.status, MembershipStatus::Active);
    }

    #[test]
    fn test_edit_keeps_dates_with_a_week_or_more_left() {
        let start = datetime!(2026-03-01 00:00 UTC);
        let membership = membership_model(&member(), start, 30);
        let now = datetime!(2026-03-24 00:00 UTC);
        let plan = plan_model(3000, 30);

        let (kind, edited) = edit_membership(
            &membership,
            &plan,
            AmountInput {
                discount: true,
                discount_amount: Decimal::from(500),
                ..Default::default()
            },
            PaymentMethod::Cash,
            now,
        );

        assert_eq!(kind, EditKind::UpdateOnly);
        assert_eq!(edited.start_date, membership.start_date);
        assert_eq!(edited.end_date, membership.end_date);
        assert_eq!(edited.renewal_count, membership.renewal_count);
        assert_eq!(edited.last_renewed_at, None);
        assert_eq!(edited.amounts.total_amount, Decimal::from(2500));
        assert!(edited.discount_applied);
    }

    #[test]
    fn test_amount_request_defaults_to_plan_fee() {
        let plan = plan_model(3000, 30);

        let input = AmountRequest {
            registration_fee: true,
            ..Default::default()
        }
        .resolve(&plan)
        .unwrap();
        assert_eq!(input.custom_registration_fee, Decimal::from(1000));
        assert_eq!(
            compute_amounts(plan.price, &input).total_amount,
            Decimal::from(4000)
        );

        let err = AmountRequest {
            discount: true,
            discount_amount: Some(DecimalString(Decimal::from(-5))),
            ..Default::default()
        }
        .resolve(&plan)
        .unwrap_err();
        assert_matches!(err, Error::ValidationError(_));
    }

    #[test]
    fn test_update_request_reads_flat_form() {
        let request: UpdateRequest = serde_json::from_value(serde_json::json!({
            "registration_fee": true,
            "custom_registration_fee": "1500",
            "discount": true,
            "discount_amount": 200,
        }))
        .unwrap();

        assert!(request.plan_id.is_none());
        assert!(request.amounts.registration_fee);
        assert_eq!(
            request.amounts.custom_registration_fee,
            Some(DecimalString(Decimal::from(1500)))
        );
        assert_eq!(
            request.amounts.discount_amount,
            Some(DecimalString(Decimal::from(200)))
        );
    }

    #[test]
    fn test_sync_warnings() {
        let mut warnings = SyncWarnings::default();

        assert_eq!(warnings.note("payment", Ok::<_, Error>(1)), Some(1));
        assert_eq!(warnings.note::<()>("receipt", Err(Error::NoResource)), None);

        assert_eq!(warnings.0, vec!["receipt: No resource found".to_string()]);
    }

    #[test]
    fn test_membership_query_filter() {
        let now = datetime!(2026-03-01 00:00 UTC);
        let query = MembershipQuery {
            status: Some(MembershipStatus::Active),
            expiring_within_days: Some(7),
            ..Default::default()
        };

        assert_eq!(
            query.filter(now),
            bson::doc! {
                "status": "Active",
                "end_date": {
                    "$gte": bson::DateTime::from(now),
                    "$lte": bson::DateTime::from(datetime!(2026-03-08 00:00 UTC)),
                },
            }
        );
    }

    #[test]
    fn test_summary_filter() {
        let user = member();
        let active = membership_model(&user, datetime!(2026-03-01 00:00 UTC), 30);
        assert_eq!(
            summary_filter(&active),
            bson::doc! { "_id": user.id, "deleted_at": null }
        );

        let pending = MembershipModel {
            status: MembershipStatus::Pending,
            ..membership_model(&user, datetime!(2026-03-01 00:00 UTC), 30)
        };
        assert_eq!(
            summary_filter(&pending),
            bson::doc! {
                "_id": user.id,
                "deleted_at": null,
                "$or": [
                    { "membership": null },
                    { "membership.membership_id": pending.id },
                ],
            }
        );
    }

    #[test]
    fn test_expiring_within_days_is_bounded() {
        let now = datetime!(2026-03-01 00:00 UTC);
        let query = MembershipQuery {
            expiring_within_days: Some(200_000_000_000_000),
            ..Default::default()
        };

        assert_matches!(query.validate(), Err(_));
        assert_eq!(
            query.filter(now).get_document("end_date").unwrap().get("$lte"),
            Some(&bson::Bson::DateTime(
                (now + Duration::days(MAX_EXPIRING_WITHIN_DAYS)).into()
            ))
        );

        let negative = MembershipQuery {
            expiring_within_days: Some(-3),
            ..Default::default()
        };
        assert_matches!(negative.validate(), Err(_));

        let week = MembershipQuery {
            expiring_within_days: Some(7),
            ..Default::default()
        };
        assert!(week.validate().is_ok());
    }

    #[test]
    fn test_summary_and_response() {
        let user = member();
        let membership = membership_model(&user, datetime!(2026-03-01 00:00 UTC), 30);

        let summary = MembershipSummary::from(&membership);
        assert_eq!(summary.membership_id, membership.id);
        assert_eq!(summary.total_amount, Decimal::from(3000));

        let response = MembershipResponse::at(membership, datetime!(2026-03-27 00:00 UTC));
        assert_eq!(response.days_remaining, 4);
    }

    #[tokio::test]
    async fn test_request_while_active_keeps_active_summary() {
        let bootstrap = bootstrap().await;
        let ledger = Ledger::from_ref(&bootstrap.app_state);

        let plan = plan_model(3000, 30);
        ledger.plans.insert_one(&plan, None).await.unwrap();
        let customer = bootstrap
            .derive("active@gym.test", "password", UserRole::Customer)
            .await;

        let active = create_membership(
            &ledger,
            CreateRequest {
                user_id: customer.user_id().into(),
                plan_id: plan.id.into(),
                amounts: AmountRequest::default(),
                payment_method: PaymentMethod::Cash,
            },
            now(),
        )
        .await
        .unwrap();

        let user = ledger.find_user(customer.user_id()).await.unwrap();
        let requested = request_membership(
            &ledger,
            &user,
            RequestMembership {
                plan_id: plan.id.into(),
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(requested.membership.status, MembershipStatus::Pending);
        assert!(requested.warnings.is_empty());

        let summary = ledger
            .find_user(customer.user_id())
            .await
            .unwrap()
            .membership
            .unwrap();
        assert_eq!(summary.membership_id, active.membership.id.0);
        assert_eq!(summary.status, MembershipStatus::Active);

        // approving the request makes it the current membership
        let approved = approve_membership(
            &ledger,
            requested.membership.id.0,
            SettleRequest::default(),
            now(),
        )
        .await
        .unwrap();
        let summary = ledger
            .find_user(customer.user_id())
            .await
            .unwrap()
            .membership
            .unwrap();
        assert_eq!(summary.membership_id, approved.membership.id.0);
        assert_eq!(summary.status, MembershipStatus::Active);
    }

    #[tokio::test]
    async fn test_first_request_fills_empty_summary() {
        let bootstrap = bootstrap().await;
        let ledger = Ledger::from_ref(&bootstrap.app_state);

        let plan = plan_model(3000, 30);
        ledger.plans.insert_one(&plan, None).await.unwrap();
        let customer = bootstrap
            .derive("new@gym.test", "password", UserRole::Customer)
            .await;

        let requested = request_membership(
            &ledger,
            &customer.user_model(),
            RequestMembership {
                plan_id: plan.id.into(),
            },
            now(),
        )
        .await
        .unwrap();
        // first-time members pay the registration fee
        assert_eq!(requested.membership.amounts.total_amount, Decimal::from(4000));

        let summary = ledger
            .find_user(customer.user_id())
            .await
            .unwrap()
            .membership
            .unwrap();
        assert_eq!(summary.membership_id, requested.membership.id.0);
        assert_eq!(summary.status, MembershipStatus::Pending);

        let err = request_membership(
            &ledger,
            &customer.user_model(),
            RequestMembership {
                plan_id: plan.id.into(),
            },
            now(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::InvalidMembershipState(_));
    }

    #[tokio::test]
    async fn test_update_without_records_reports_warnings() {
        let bootstrap = bootstrap().await;
        let ledger = Ledger::from_ref(&bootstrap.app_state);

        let plan = plan_model(3000, 30);
        ledger.plans.insert_one(&plan, None).await.unwrap();
        let customer = bootstrap
            .derive("legacy@gym.test", "password", UserRole::Customer)
            .await;

        // imported membership with no payment or receipt behind it
        let membership = MembershipModel {
            plan_id: plan.id,
            ..membership_model(&customer.user_model(), now(), 30)
        };
        ledger.memberships.insert_one(&membership, None).await.unwrap();

        let outcome =
            update_existing_membership(&ledger, membership.id, UpdateRequest::default(), now())
                .await
                .unwrap();

        assert_eq!(outcome.action, MembershipAction::Updated);
        assert_eq!(
            outcome.warnings,
            vec![
                "payment: no payment found for membership".to_string(),
                "receipt: no receipt found for membership".to_string(),
            ]
        );

        let summary = ledger
            .find_user(customer.user_id())
            .await
            .unwrap()
            .membership
            .unwrap();
        assert_eq!(summary.membership_id, membership.id);
    }

    #[tokio::test]
    async fn test_renewal_records_new_payment_and_receipt() {
        let bootstrap = bootstrap().await;
        let ledger = Ledger::from_ref(&bootstrap.app_state);

        let plan = plan_model(3000, 30);
        ledger.plans.insert_one(&plan, None).await.unwrap();
        let customer = bootstrap
            .derive("renew@gym.test", "password", UserRole::Customer)
            .await;

        let created = create_membership(
            &ledger,
            CreateRequest {
                user_id: customer.user_id().into(),
                plan_id: plan.id.into(),
                amounts: AmountRequest::default(),
                payment_method: PaymentMethod::Cash,
            },
            now() - Duration::days(27),
        )
        .await
        .unwrap();
        let id = created.membership.id.0;

        let now = now();
        let renewed = renew_membership(&ledger, id, SettleRequest::default(), now)
            .await
            .unwrap();
        assert_eq!(renewed.action, MembershipAction::Renewed);
        assert_eq!(renewed.membership.renewal_count, 1);
        assert_eq!(renewed.membership.days_remaining, 30);

        let payments = ledger
            .payments
            .count_documents(bson::doc! { "membership_id": id }, None)
            .await
            .unwrap();
        let receipts = ledger
            .receipts
            .count_documents(bson::doc! { "membership_id": id }, None)
            .await
            .unwrap();
        assert_eq!((payments, receipts), (2, 2));
    }

    #[tokio::test]
    async fn test_update_existing_membership_flow() {
        let bootstrap = bootstrap().await;
        let ledger = Ledger::from_ref(&bootstrap.app_state);

        let plan = plan_model(3000, 30);
        ledger.plans.insert_one(&plan, None).await.unwrap();
        let customer = bootstrap
            .derive("customer@gym.test", "password", UserRole::Customer)
            .await;

        let start = now() - Duration::days(25);
        let created = create_membership(
            &ledger,
            CreateRequest {
                user_id: customer.user_id().into(),
                plan_id: plan.id.into(),
                amounts: AmountRequest::default(),
                payment_method: PaymentMethod::Cash,
            },
            start,
        )
        .await
        .unwrap();
        assert!(created.warnings.is_empty());
        let id = created.membership.id.0;

        // 5 days left: renewal
        let now = now();
        let outcome = update_existing_membership(&ledger, id, UpdateRequest::default(), now)
            .await
            .unwrap();
        assert_eq!(outcome.action, MembershipAction::Renewed);
        assert_eq!(outcome.membership.renewal_count, 1);
        assert!(outcome.payment.is_some());

        // fresh window: update only
        let outcome = update_existing_membership(
            &ledger,
            id,
            UpdateRequest {
                amounts: AmountRequest {
                    discount: true,
                    discount_amount: Some(DecimalString(Decimal::from(500))),
                    ..Default::default()
                },
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(outcome.action, MembershipAction::Updated);
        assert_eq!(outcome.membership.renewal_count, 1);
        assert!(outcome.warnings.is_empty());

        let payment = ledger.payments.latest_for_membership(id).await.unwrap().unwrap();
        assert_eq!(payment.amount, Decimal::from(2500));

        let err = renew_membership(&ledger, id, SettleRequest::default(), now)
            .await
            .unwrap_err();
        assert_matches!(err, Error::RenewalNotAllowed { days_remaining: 30 });

        let user = ledger.find_user(customer.user_id()).await.unwrap();
        assert_eq!(
            user.membership.map(|it| it.total_amount),
            Some(Decimal::from(2500))
        );
    }
}
