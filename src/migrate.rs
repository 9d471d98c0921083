use std::collections::HashSet;

use bson::oid::ObjectId;
use mongodb::{options::IndexOptions, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, mongo_ext::Collection};

#[derive(Serialize, Deserialize)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version(&self, version: i64) -> Result<(), mongodb::error::Error> {
        self.insert_one(
            MigrateModel {
                id: ObjectId::new(),
                version,
            },
            None,
        )
        .await
        .map(|_| ())
    }
}

fn index(keys: bson::Document, unique: bool) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(unique).build())
        .build()
}

impl AppState {
    async fn v1_migrate(&self) -> Result<(), mongodb::error::Error> {
        self.migrate_collection
            .create_index(index(bson::doc! { "version": 1 }, true), None)
            .await?;

        self.user_collection
            .create_index(index(bson::doc! { "email": 1 }, true), None)
            .await?;

        self.receipt_collection
            .create_index(index(bson::doc! { "user_id": 1, "created_at": -1 }, false), None)
            .await?;

        self.payment_collection
            .create_index(
                index(bson::doc! { "period.year": 1, "period.month": 1 }, false),
                None,
            )
            .await?;

        self.membership_collection
            .create_index(index(bson::doc! { "user_id": 1 }, false), None)
            .await?;

        Ok(())
    }

    async fn v2_migrate(&self) -> Result<(), mongodb::error::Error> {
        self.payment_collection
            .create_index(index(bson::doc! { "membership_id": 1, "paid_at": -1 }, false), None)
            .await?;

        self.expense_collection
            .create_index(
                index(bson::doc! { "period.year": 1, "period.month": 1 }, false),
                None,
            )
            .await?;

        self.user_collection
            .create_index(index(bson::doc! { "membership.membership_id": 1 }, false), None)
            .await?;

        Ok(())
    }

    async fn get_all_migration(&self) -> Result<Vec<MigrateModel>, mongodb::error::Error> {
        let mut cursor = self.migrate_collection.find(None, None).await?;

        let mut vec = vec![];

        while cursor.advance().await? {
            vec.push(cursor.deserialize_current()?);
        }

        Ok(vec)
    }

    /// Applies every migration not yet recorded. Index creation is idempotent,
    /// so a run interrupted before its version is recorded is safe to repeat.
    pub async fn run_migration(&self) -> Result<(), mongodb::error::Error> {
        let migration: HashSet<i64> = self
            .get_all_migration()
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect();

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !migration.contains(&$version) {
                    tracing::info!("running migration version {}", $version);
                    self.$fun().await?;
                    self.migrate_collection.insert_version($version).await?;
                }
            };
        }

        migrate!(1, v1_migrate);
        migrate!(2, v2_migrate);

        Ok(())
    }
}
