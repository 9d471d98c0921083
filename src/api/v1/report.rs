use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use validator::Validate;

use crate::{
    app::AppState,
    billing::PeriodFields,
    error::Error,
    report::{self, Entry, MembershipCounts, Summary, YearReport},
    util::now,
};

use super::{
    auth::{UserAccess, UserRole},
    expense::{ExpenseCollection, ExpenseModel, ExpenseQuery},
    payment::{PaymentCollection, PaymentModel, PaymentQuery},
};

#[derive(Validate, Deserialize, Debug, Default, Clone)]
pub struct ReportQuery {
    /// Defaults to the current year.
    #[validate(range(min = 2000, max = 9999))]
    pub year: Option<i32>,

    #[validate(range(min = 1, max = 12))]
    pub month: Option<i32>,
}

impl ReportQuery {
    fn year(&self) -> i32 {
        self.year.unwrap_or_else(|| now().year())
    }
}

fn payment_entry(payment: &PaymentModel) -> Entry<'_> {
    Entry {
        year: payment.period.year,
        month: payment.period.month,
        label: &payment.plan_type,
        amount: payment.amount,
    }
}

fn expense_entry(expense: &ExpenseModel) -> Entry<'_> {
    Entry {
        year: expense.period.year,
        month: expense.period.month,
        label: expense.category.as_str(),
        amount: expense.amount,
    }
}

// archived payments still count towards revenue
async fn payments_of(
    payments: &PaymentCollection,
    year: i32,
    month: Option<i32>,
) -> Result<Vec<PaymentModel>, Error> {
    payments
        .search(&PaymentQuery {
            year: Some(year),
            month,
            include_archived: true,
            ..Default::default()
        })
        .await
}

async fn expenses_of(
    expenses: &ExpenseCollection,
    year: i32,
    month: Option<i32>,
) -> Result<Vec<ExpenseModel>, Error> {
    expenses
        .search(&ExpenseQuery {
            year: Some(year),
            month,
            ..Default::default()
        })
        .await
}

pub async fn revenue(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
    Query(query): Query<ReportQuery>,
) -> Result<Json<YearReport>, Error> {
    user.require_admin()?;
    query.validate()?;

    let year = query.year();
    let payments = payments_of(&payments, year, None).await?;
    let entries = payments.iter().map(payment_entry).collect::<Vec<_>>();

    Ok(Json(report::year_report(&entries, year)))
}

pub async fn expenses(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    Query(query): Query<ReportQuery>,
) -> Result<Json<YearReport>, Error> {
    user.require_admin()?;
    query.validate()?;

    let year = query.year();
    let expenses = expenses_of(&expenses, year, None).await?;
    let entries = expenses.iter().map(expense_entry).collect::<Vec<_>>();

    Ok(Json(report::year_report(&entries, year)))
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn summary(
    State(state): State<AppState>,
    user: UserAccess,
    Query(query): Query<ReportQuery>,
) -> Result<Json<Summary>, Error> {
    user.require_admin()?;
    query.validate()?;

    let now = now();
    let year = query.year();

    let payments = payments_of(&state.payment_collection, year, query.month).await?;
    let expenses = expenses_of(&state.expense_collection, year, query.month).await?;

    let memberships = state.membership_collection.find_all(None, None).await?;
    let counts = MembershipCounts::tally(
        memberships
            .iter()
            .map(|it| (it.status, it.start_date.into(), it.end_date.into())),
        now,
    );

    let new_customers = state
        .user_collection
        .find_exists(bson::doc! { "role": UserRole::Customer.as_str() }, None)
        .await?
        .iter()
        .map(|it| PeriodFields::of(it.created_at.into()))
        .filter(|it| it.year == year && query.month.map_or(true, |month| it.month == month))
        .count();

    let payment_entries = payments.iter().map(payment_entry).collect::<Vec<_>>();
    let expense_entries = expenses.iter().map(expense_entry).collect::<Vec<_>>();

    Ok(Json(report::summarize(
        &payment_entries,
        &expense_entries,
        year,
        query.month,
        counts,
        new_customers,
    )))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Query, Json};
    use bson::oid::ObjectId;
    use rust_decimal::Decimal;
    use time::macros::datetime;

    use super::*;
    use crate::api::v1::{
        auth::UserModel,
        expense::{tests::expense_model, ExpenseCategory},
        payment::{new_payment, PaymentMethod},
        tests::bootstrap,
    };

    #[test]
    fn test_query_validation() {
        let query = ReportQuery {
            year: Some(2026),
            month: Some(13),
        };
        assert!(query.validate().is_err());

        let query = ReportQuery {
            year: None,
            month: Some(12),
        };
        assert!(query.validate().is_ok());
        assert_eq!(query.year(), now().year());
    }

    #[test]
    fn test_entries_carry_period_and_label() {
        let user = UserModel::new_for_test("member@gym.test", UserRole::Customer);
        let payment = new_payment(
            &user,
            ObjectId::new(),
            "Quarterly",
            Decimal::from(8000),
            PaymentMethod::Cash,
            datetime!(2026-08-02 10:00 UTC),
        );
        let entry = payment_entry(&payment);
        assert_eq!((entry.year, entry.month, entry.label), (2026, 8, "Quarterly"));

        let expense = expense_model(ExpenseCategory::Rent, 5000, datetime!(2026-08-01 00:00 UTC));
        let entry = expense_entry(&expense);
        assert_eq!(entry.label, "Rent");
        assert_eq!(entry.amount, Decimal::from(5000));
    }

    #[tokio::test]
    async fn test_revenue_includes_archived() {
        let bootstrap = bootstrap().await;
        let user = UserModel::new_for_test("member@gym.test", UserRole::Customer);

        let mut archived = new_payment(
            &user,
            ObjectId::new(),
            "Monthly",
            Decimal::from(3000),
            PaymentMethod::Cash,
            datetime!(2026-01-05 00:00 UTC),
        );
        archived.is_archived = true;
        let current = new_payment(
            &user,
            ObjectId::new(),
            "Monthly",
            Decimal::from(3000),
            PaymentMethod::Card,
            datetime!(2026-02-05 00:00 UTC),
        );
        bootstrap
            .app_state
            .payment_collection
            .insert_many([&archived, &current], None)
            .await
            .unwrap();

        let Json(report) = revenue(
            bootstrap.payment_collection(),
            bootstrap.user_access(),
            Query(ReportQuery {
                year: Some(2026),
                month: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.total.0, Decimal::from(6000));
        assert_eq!(report.count, 2);

        let receptionist = bootstrap
            .derive("desk@gym.test", "password", UserRole::Receptionist)
            .await;
        let err = revenue(
            receptionist.payment_collection(),
            receptionist.user_access(),
            Query(ReportQuery::default()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden);
    }
}
