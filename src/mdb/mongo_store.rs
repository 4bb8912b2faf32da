//! MongoDB 存储网关实现
//! MongoDB store gateway implementation

use crate::base::{FindAndUpdateOptions, JobStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection, IndexModel};

/// 基于 MongoDB 驱动的任务存储
/// Job store backed by the MongoDB driver
pub struct MongoStore {
  collection: Collection<Document>,
}

impl MongoStore {
  /// 连接到连接串指向的数据库并使用给定集合
  /// Connect to the database named in the connection string and use the
  /// given collection
  pub async fn connect(uri: &str, collection: &str) -> Result<Self> {
    let client = Client::with_uri_str(uri).await?;
    let database = client
      .default_database()
      .ok_or_else(|| Error::config("connection string must name a database"))?;
    Ok(Self {
      collection: database.collection(collection),
    })
  }

  /// 复用一个已有集合句柄
  /// Reuse an existing collection handle
  pub fn with_collection(collection: Collection<Document>) -> Self {
    Self { collection }
  }
}

#[async_trait]
impl JobStore for MongoStore {
  async fn find_one_and_update(
    &self,
    filter: Document,
    update: Document,
    options: FindAndUpdateOptions,
  ) -> Result<Option<Document>> {
    let mut action = self
      .collection
      .find_one_and_update(filter, update)
      .upsert(options.upsert)
      .return_document(ReturnDocument::After);
    if let Some(sort) = options.sort {
      action = action.sort(sort);
    }
    Ok(action.await?)
  }

  async fn find(&self, filter: Document) -> Result<Vec<Document>> {
    let cursor = self.collection.find(filter).await?;
    Ok(cursor.try_collect().await?)
  }

  async fn insert_one(&self, mut document: Document) -> Result<Document> {
    let result = self.collection.insert_one(&document).await?;
    document.insert("_id", result.inserted_id);
    Ok(document)
  }

  async fn update_many(&self, filter: Document, update: Document) -> Result<u64> {
    Ok(
      self
        .collection
        .update_many(filter, update)
        .await?
        .modified_count,
    )
  }

  async fn delete_many(&self, filter: Document) -> Result<u64> {
    Ok(self.collection.delete_many(filter).await?.deleted_count)
  }

  async fn ensure_indexes(&self) {
    let keys = [
      doc! { "name": 1, "priority": -1, "lockedAt": 1, "nextRunAt": 1, "disabled": 1 },
      doc! { "name": 1, "lockedAt": 1, "priority": -1, "nextRunAt": 1, "disabled": 1 },
    ];
    for key in keys {
      let index = IndexModel::builder().keys(key).build();
      if let Err(error) = self.collection.create_index(index).await {
        tracing::warn!("index creation failed: {}", error);
      }
    }
  }
}
