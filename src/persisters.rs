use crate::core::Persister;
use crate::models::{Location, LocationCommand};
use anyhow::Error;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, IndexOptions, UpdateOptions};
use mongodb::IndexModel;
use std::future::Future;
use std::pin::Pin;

const COLLECTION: &str = "extra_locations";

#[derive(Clone)]
pub(crate) struct MongoPersister {
    coll: mongodb::Collection<Location<i64>>,
}

impl MongoPersister {
    pub fn new(db: mongodb::Database) -> Self {
        Self {
            coll: db.collection(COLLECTION),
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        let unique = IndexModel::builder()
            .keys(doc! {"extra_id": 1})
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let cells = IndexModel::builder().keys(doc! {"geo_index": 1}).build();
        self.coll.create_indexes([unique, cells], None).await?;
        Ok(())
    }

    async fn find(&self, filter: Document, options: Option<FindOptions>) -> Result<Vec<Location<i64>>, Error> {
        let cursor = self.coll.find(filter, options).await?;
        let locs: Vec<Location<i64>> = cursor.try_collect().await?;
        Ok(locs)
    }
}

impl Persister<i64> for MongoPersister {
    fn upsert<'a>(&'a self, loc: LocationCommand<i64>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        i64: 'a,
    {
        Box::pin(async move {
            self.coll
                .update_one(
                    doc! {"extra_id": &loc.extra_id},
                    doc! {"$set": {
                        "geo_index": loc.geo_index,
                        "location": loc.location,
                        "key_version": loc.key_version,
                        "updated_at": chrono::Utc::now().timestamp_millis(),
                    }},
                    UpdateOptions::builder().upsert(true).build(),
                )
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, extra_id: &'a str) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + 'a>> {
        Box::pin(async move {
            let res = self.coll.delete_one(doc! {"extra_id": extra_id}, None).await?;
            Ok(res.deleted_count > 0)
        })
    }

    fn query<'a>(&'a self, indices: Vec<i64>) -> Pin<Box<dyn Future<Output = Result<Vec<Location<i64>>, Error>> + 'a>>
    where
        i64: 'a,
    {
        Box::pin(async move { self.find(doc! {"geo_index": {"$in": indices}}, None).await })
    }

    fn scan<'a>(&'a self, after: Option<String>, limit: i64) -> Pin<Box<dyn Future<Output = Result<Vec<Location<i64>>, Error>> + 'a>>
    where
        i64: 'a,
    {
        Box::pin(async move {
            let filter = match after {
                Some(after) => doc! {"extra_id": {"$gt": after}},
                None => doc! {},
            };
            let options = FindOptions::builder().sort(doc! {"extra_id": 1}).limit(limit).build();
            self.find(filter, Some(options)).await
        })
    }

    fn rekey<'a>(
        &'a self,
        extra_id: &'a str,
        expected_version: i32,
        location: String,
        key_version: i32,
    ) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + 'a>> {
        Box::pin(async move {
            let res = self
                .coll
                .update_one(
                    doc! {"extra_id": extra_id, "key_version": expected_version},
                    doc! {"$set": {
                        "location": location,
                        "key_version": key_version,
                        "updated_at": chrono::Utc::now().timestamp_millis(),
                    }},
                    None,
                )
                .await?;
            Ok(res.matched_count == 1)
        })
    }
}
