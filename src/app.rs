use axum::extract::FromRef;

use crate::{
    api::v1::{
        auth::UserCollection,
        expense::ExpenseCollection,
        membership::MembershipCollection,
        payment::PaymentCollection,
        plan::PlanCollection,
        receipt::ReceiptCollection,
        token::{JwtState, RefreshTokenCollection},
    },
    cloudinary::CloudinaryClient,
    config::Config,
    migrate::MigrationCollection,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub cloudinary: CloudinaryClient,
    pub payment_retention_months: i64,

    pub mongo_client: mongodb::Client,
    pub migrate_collection: MigrationCollection,
    pub token_collection: RefreshTokenCollection,
    pub user_collection: UserCollection,
    pub plan_collection: PlanCollection,
    pub membership_collection: MembershipCollection,
    pub payment_collection: PaymentCollection,
    pub receipt_collection: ReceiptCollection,
    pub expense_collection: ExpenseCollection,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::from_keys(&config.jwt)?;

        let mongo_client_opt = mongodb::options::ClientOptions::parse(&config.mongodb_uri).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(&config.database_name);
        tracing::info!(database = %config.database_name, "connected to mongodb");

        Ok(Self {
            argon,
            jwt_state,
            cloudinary: CloudinaryClient::new(config.cloudinary.clone()),
            payment_retention_months: config.payment_retention_months,

            mongo_client,
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
            token_collection: RefreshTokenCollection(db.collection("refresh_tokens").into()),
            user_collection: UserCollection(db.collection("users").into()),
            plan_collection: PlanCollection(db.collection("plans").into()),
            membership_collection: MembershipCollection(db.collection("memberships").into()),
            payment_collection: PaymentCollection(db.collection("payments").into()),
            receipt_collection: ReceiptCollection(db.collection("receipts").into()),
            expense_collection: ExpenseCollection(db.collection("expenses").into()),
        })
    }
}
