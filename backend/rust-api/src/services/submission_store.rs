use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics::record_store_write;
use crate::models::submission::{Submission, SubmissionFields};
use crate::models::Exercise;

const COLLECTION: &str = "submissions";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Submission {0} not found")]
    NotFound(String),
    #[error("A submission for user {user_id} and exercise '{exercise}' already exists")]
    Conflict { user_id: String, exercise: Exercise },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable submission records, at most one per `(user_id, exercise)`.
///
/// `create` and `update` always take the full field set; `delete` only
/// accepts the record identifier, so callers resolve it through `list`.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn list(&self, user_id: &str) -> Result<Vec<Submission>, StoreError>;

    async fn create(&self, fields: SubmissionFields) -> Result<Submission, StoreError>;

    async fn update(&self, id: &str, fields: SubmissionFields) -> Result<Submission, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmissionDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    exercise: Exercise,
    submission: String,
    response: String,
    passed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubmissionDocument> for Submission {
    fn from(doc: SubmissionDocument) -> Self {
        Submission {
            id: doc.id,
            user_id: doc.user_id,
            exercise: doc.exercise,
            submission: doc.submission,
            response: doc.response,
            passed: doc.passed,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

pub struct MongoSubmissionStore {
    collection: Collection<SubmissionDocument>,
}

impl MongoSubmissionStore {
    pub fn new(mongo: Database) -> Self {
        Self {
            collection: mongo.collection(COLLECTION),
        }
    }

    /// Unique `(user_id, exercise)` index backs the one-record-per-exercise
    /// invariant across API instances.
    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        let unique_key = IndexModel::builder()
            .keys(doc! { "user_id": 1, "exercise": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("user_exercise_unique".to_string())
                    .build(),
            )
            .build();
        let by_user = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(IndexOptions::builder().name("user_id".to_string()).build())
            .build();

        self.collection
            .create_indexes([unique_key, by_user])
            .await
            .context("Failed to create submission indexes")?;

        tracing::info!("Submission indexes ensured");
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MongoSubmissionStore {
    async fn list(&self, user_id: &str) -> Result<Vec<Submission>, StoreError> {
        let cursor = self
            .collection
            .find(doc! { "user_id": user_id })
            .await
            .context("Failed to query submissions")?;

        let documents: Vec<SubmissionDocument> = cursor
            .try_collect()
            .await
            .context("Failed to read submissions cursor")?;

        Ok(documents.into_iter().map(Submission::from).collect())
    }

    async fn create(&self, fields: SubmissionFields) -> Result<Submission, StoreError> {
        let now = Utc::now();
        let document = SubmissionDocument {
            id: Uuid::new_v4().to_string(),
            user_id: fields.user_id,
            exercise: fields.exercise,
            submission: fields.submission,
            response: fields.response,
            passed: fields.passed,
            created_at: now,
            updated_at: now,
        };

        match self.collection.insert_one(&document).await {
            Ok(_) => {
                record_store_write("create", "ok");
                tracing::info!(
                    "Submission created: id={}, user={}, exercise={}",
                    document.id,
                    document.user_id,
                    document.exercise
                );
                Ok(document.into())
            }
            Err(e) if is_duplicate_key(&e) => {
                record_store_write("create", "conflict");
                Err(StoreError::Conflict {
                    user_id: document.user_id,
                    exercise: document.exercise,
                })
            }
            Err(e) => {
                record_store_write("create", "error");
                Err(anyhow::Error::new(e)
                    .context("Failed to insert submission")
                    .into())
            }
        }
    }

    async fn update(&self, id: &str, fields: SubmissionFields) -> Result<Submission, StoreError> {
        let updated_at = mongodb::bson::to_bson(&Utc::now())
            .context("Failed to encode update timestamp")?;
        let update = doc! {
            "$set": {
                "user_id": &fields.user_id,
                "exercise": fields.exercise.as_str(),
                "submission": &fields.submission,
                "response": &fields.response,
                "passed": fields.passed,
                "updated_at": updated_at,
            }
        };

        let result = self
            .collection
            .find_one_and_update(doc! { "_id": id }, update)
            .return_document(ReturnDocument::After)
            .await;

        match result {
            Ok(Some(document)) => {
                record_store_write("update", "ok");
                Ok(document.into())
            }
            Ok(None) => {
                record_store_write("update", "not_found");
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) if is_duplicate_key(&e) => {
                record_store_write("update", "conflict");
                Err(StoreError::Conflict {
                    user_id: fields.user_id,
                    exercise: fields.exercise,
                })
            }
            Err(e) => {
                record_store_write("update", "error");
                Err(anyhow::Error::new(e)
                    .context("Failed to update submission")
                    .into())
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = self
            .collection
            .delete_one(doc! { "_id": id })
            .await
            .context("Failed to delete submission")?;

        if result.deleted_count == 0 {
            record_store_write("delete", "not_found");
            return Err(StoreError::NotFound(id.to_string()));
        }

        record_store_write("delete", "ok");
        tracing::info!("Submission deleted: id={}", id);
        Ok(())
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match *error.kind {
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) => {
            we.code == 11000
        }
        mongodb::error::ErrorKind::Command(ref ce) => ce.code == 11000,
        _ => false,
    }
}

/// Process-local store used by `storage.backend = "memory"` and by tests.
/// Enforces the same uniqueness key as the Mongo index.
#[derive(Default)]
pub struct InMemorySubmissionStore {
    records: RwLock<HashMap<String, Submission>>,
}

impl InMemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn list(&self, user_id: &str) -> Result<Vec<Submission>, StoreError> {
        let records = self.records.read().await;
        let mut submissions: Vec<Submission> = records
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        submissions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(submissions)
    }

    async fn create(&self, fields: SubmissionFields) -> Result<Submission, StoreError> {
        let mut records = self.records.write().await;
        if records
            .values()
            .any(|s| s.belongs_to(&fields.user_id, fields.exercise))
        {
            return Err(StoreError::Conflict {
                user_id: fields.user_id,
                exercise: fields.exercise,
            });
        }

        let now = Utc::now();
        let submission = Submission {
            id: Uuid::new_v4().to_string(),
            user_id: fields.user_id,
            exercise: fields.exercise,
            submission: fields.submission,
            response: fields.response,
            passed: fields.passed,
            created_at: now,
            updated_at: now,
        };
        records.insert(submission.id.clone(), submission.clone());
        Ok(submission)
    }

    async fn update(&self, id: &str, fields: SubmissionFields) -> Result<Submission, StoreError> {
        let mut records = self.records.write().await;
        if records
            .values()
            .any(|s| s.id != id && s.belongs_to(&fields.user_id, fields.exercise))
        {
            return Err(StoreError::Conflict {
                user_id: fields.user_id,
                exercise: fields.exercise,
            });
        }

        let existing = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        existing.user_id = fields.user_id;
        existing.exercise = fields.exercise;
        existing.submission = fields.submission;
        existing.response = fields.response;
        existing.passed = fields.passed;
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::from_document;
    use mongodb::error::{CommandError, ErrorKind, WriteError, WriteFailure};

    #[test]
    fn duplicate_key_detected_from_write_and_command_errors() {
        let write: WriteError =
            from_document(doc! { "code": 11000, "errmsg": "E11000 duplicate key error" }).unwrap();
        let err = mongodb::error::Error::from(ErrorKind::Write(WriteFailure::WriteError(write)));
        assert!(is_duplicate_key(&err));

        let command: CommandError =
            from_document(doc! { "code": 11000, "codeName": "DuplicateKey", "errmsg": "E11000" })
                .unwrap();
        assert!(is_duplicate_key(&ErrorKind::Command(command).into()));

        let unauthorized: CommandError =
            from_document(doc! { "code": 13, "codeName": "Unauthorized" }).unwrap();
        assert!(!is_duplicate_key(&ErrorKind::Command(unauthorized).into()));
    }

    fn fields(user: &str, exercise: Exercise, code: &str) -> SubmissionFields {
        SubmissionFields {
            user_id: user.to_string(),
            exercise,
            submission: code.to_string(),
            response: String::new(),
            passed: false,
        }
    }

    #[tokio::test]
    async fn in_memory_store_enforces_user_exercise_key() {
        let store = InMemorySubmissionStore::new();
        store
            .create(fields("u1", Exercise::LinearSearch, "a"))
            .await
            .unwrap();

        let err = store
            .create(fields("u1", Exercise::LinearSearch, "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Other users and other exercises are independent keys
        store
            .create(fields("u2", Exercise::LinearSearch, "c"))
            .await
            .unwrap();
        store
            .create(fields("u1", Exercise::BinarySearch, "d"))
            .await
            .unwrap();
        assert_eq!(store.len().await, 3);
        assert_eq!(store.list("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn in_memory_update_keeps_id_and_created_at() {
        let store = InMemorySubmissionStore::new();
        let created = store
            .create(fields("u1", Exercise::BinarySearch, "first"))
            .await
            .unwrap();

        let mut next = fields("u1", Exercise::BinarySearch, "second");
        next.passed = true;
        let updated = store.update(&created.id, next).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.submission, "second");
        assert!(updated.passed);
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn in_memory_missing_ids_are_not_found() {
        let store = InMemorySubmissionStore::new();
        assert!(matches!(
            store.delete("missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .update("missing", fields("u1", Exercise::LinearSearch, "x"))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }
}
