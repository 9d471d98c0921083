use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use mongodb::options::FindOptions;

use crate::{
    csv_export::{self, CsvRow},
    error::Error,
};

use super::{
    account,
    auth::{UserAccess, UserCollection, UserModel},
    expense::{ExpenseCollection, ExpenseModel, ExpenseQuery},
    payment::{PaymentCollection, PaymentModel, PaymentQuery},
};

fn datetime_cell(value: bson::DateTime) -> String {
    value.try_to_rfc3339_string().unwrap_or_default()
}

impl CsvRow for PaymentModel {
    const HEADERS: &'static [&'static str] = &[
        "transaction_id",
        "user_id",
        "membership_id",
        "plan_type",
        "amount",
        "method",
        "paid_at",
        "month",
        "archived",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.transaction_id.clone(),
            self.user_id.to_hex(),
            self.membership_id.to_hex(),
            self.plan_type.clone(),
            self.amount.to_string(),
            self.method.as_str().to_string(),
            datetime_cell(self.paid_at),
            self.period.month_key.clone(),
            self.is_archived.to_string(),
        ]
    }
}

impl CsvRow for ExpenseModel {
    const HEADERS: &'static [&'static str] = &[
        "title",
        "category",
        "amount",
        "description",
        "expense_date",
        "month",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.title.clone(),
            self.category.as_str().to_string(),
            self.amount.to_string(),
            self.description.clone(),
            datetime_cell(self.expense_date),
            self.period.month_key.clone(),
        ]
    }
}

impl CsvRow for UserModel {
    const HEADERS: &'static [&'static str] = &[
        "name",
        "email",
        "phone",
        "cnic",
        "gender",
        "role",
        "plan_type",
        "status",
        "start_date",
        "end_date",
        "total_amount",
        "joined_at",
    ];

    fn cells(&self) -> Vec<String> {
        let membership = self.membership.as_ref();

        vec![
            self.name.clone(),
            self.email.clone(),
            self.phone.clone().unwrap_or_default(),
            self.cnic.clone().unwrap_or_default(),
            self.gender.map(|it| it.as_str()).unwrap_or_default().to_string(),
            self.role.as_str().to_string(),
            membership.map(|it| it.plan_type.clone()).unwrap_or_default(),
            membership.map(|it| it.status.as_str()).unwrap_or_default().to_string(),
            membership.map(|it| datetime_cell(it.start_date)).unwrap_or_default(),
            membership.map(|it| datetime_cell(it.end_date)).unwrap_or_default(),
            membership.map(|it| it.total_amount.to_string()).unwrap_or_default(),
            datetime_cell(self.created_at),
        ]
    }
}

fn csv_response<T: CsvRow>(file_name: &'static str, rows: &[T]) -> impl IntoResponse {
    tracing::debug!(file_name, rows = rows.len(), "exporting csv");

    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        csv_export::render(rows),
    )
}

pub async fn payments(
    State(payments): State<PaymentCollection>,
    user: UserAccess,
    Query(query): Query<PaymentQuery>,
) -> Result<impl IntoResponse, Error> {
    user.require_staff()?;

    let payments = payments.search(&query).await?;

    Ok(csv_response("payments.csv", &payments))
}

pub async fn expenses(
    State(expenses): State<ExpenseCollection>,
    user: UserAccess,
    Query(query): Query<ExpenseQuery>,
) -> Result<impl IntoResponse, Error> {
    user.require_admin()?;

    let expenses = expenses.search(&query).await?;

    Ok(csv_response("expenses.csv", &expenses))
}

pub async fn members(
    State(users): State<UserCollection>,
    user: UserAccess,
    Query(query): Query<account::IndexQuery>,
) -> Result<impl IntoResponse, Error> {
    user.require_staff()?;

    let users = users
        .find_all(
            query.filter(),
            FindOptions::builder().sort(bson::doc! { "name": 1 }).build(),
        )
        .await?;

    Ok(csv_response("members.csv", &users))
}

#[cfg(test)]
mod tests {
    use axum::body::HttpBody;
    use bson::oid::ObjectId;
    use rust_decimal::Decimal;
    use time::macros::datetime;

    use super::*;
    use crate::api::v1::{
        auth::UserRole,
        expense::{tests::expense_model, ExpenseCategory},
        membership::{tests::membership_model, MembershipSummary},
        payment::{new_payment, PaymentMethod},
        tests::bootstrap,
    };

    #[test]
    fn test_payment_row() {
        let user = UserModel::new_for_test("member@gym.test", UserRole::Customer);
        let payment = new_payment(
            &user,
            ObjectId::new(),
            "Monthly",
            Decimal::from(3000),
            PaymentMethod::BankTransfer,
            datetime!(2026-04-02 09:30 UTC),
        );

        let cells = payment.cells();
        assert_eq!(cells.len(), PaymentModel::HEADERS.len());
        assert_eq!(cells[4], "3000");
        assert_eq!(cells[5], "BankTransfer");
        assert_eq!(cells[6], "2026-04-02T09:30:00Z");
        assert_eq!(cells[7], "2026-04");
    }

    #[test]
    fn test_member_row_with_and_without_membership() {
        let mut user = UserModel::new_for_test("member@gym.test", UserRole::Customer);
        let cells = user.cells();
        assert_eq!(cells.len(), UserModel::HEADERS.len());
        assert_eq!(cells[6], "");

        let membership = membership_model(&user, datetime!(2026-03-01 00:00 UTC), 30);
        user.membership = Some(MembershipSummary::from(&membership));
        let cells = user.cells();
        assert_eq!(cells[6], "Monthly");
        assert_eq!(cells[7], "Active");
        assert_eq!(cells[9], "2026-03-31T00:00:00Z");
    }

    async fn body_text(response: axum::response::Response) -> String {
        let mut body = response.into_body();
        let mut bytes = vec![];
        while let Some(chunk) = body.data().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_export_row_count_matches_filtered_records() {
        let bootstrap = bootstrap().await;
        let State(collection) = bootstrap.expense_collection();

        let expenses = [
            (ExpenseCategory::Rent, 5000, datetime!(2026-01-01 00:00 UTC)),
            (ExpenseCategory::Utilities, 800, datetime!(2026-01-15 00:00 UTC)),
            (ExpenseCategory::Rent, 5000, datetime!(2026-02-01 00:00 UTC)),
            (ExpenseCategory::Rent, 5200, datetime!(2025-12-01 00:00 UTC)),
        ]
        .into_iter()
        .map(|(category, amount, at)| expense_model(category, amount, at))
        .collect::<Vec<_>>();
        collection.insert_many(&expenses, None).await.unwrap();

        let query = ExpenseQuery {
            year: Some(2026),
            category: Some(ExpenseCategory::Rent),
            ..Default::default()
        };
        let listed = collection.search(&query).await.unwrap();
        assert_eq!(listed.len(), 2);

        let response = super::expenses(
            bootstrap.expense_collection(),
            bootstrap.user_access(),
            Query(query),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );

        let csv = body_text(response).await;
        assert!(csv.starts_with("title,category,amount,description,expense_date,month\r\n"));
        assert_eq!(csv.matches("\r\n").count(), listed.len() + 1);
        assert!(!csv.contains("Utilities"));
        assert!(!csv.contains("2025-12"));
    }
}
