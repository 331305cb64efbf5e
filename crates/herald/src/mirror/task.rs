use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{CopySource, ProxiedRequest, S3Op};
use crate::config::{BackendRef, Bucket};
use crate::error::HeraldResult;
use crate::header;
use crate::utils::{base64_decode, base64_encode};

/// The mutating verbs replayed against replicas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MirrorCommand {
    PutObject,
    DeleteObject,
    DeleteObjects,
    CopyObject,
    CreateBucket,
    DeleteBucket,
    CompleteMultipartUpload,
}

impl MirrorCommand {
    #[must_use]
    pub fn from_op(op: &S3Op) -> Option<Self> {
        match op {
            S3Op::PutObject => Some(Self::PutObject),
            S3Op::DeleteObject => Some(Self::DeleteObject),
            S3Op::DeleteObjects => Some(Self::DeleteObjects),
            S3Op::CopyObject { .. } => Some(Self::CopyObject),
            S3Op::CreateBucket => Some(Self::CreateBucket),
            S3Op::DeleteBucket => Some(Self::DeleteBucket),
            S3Op::CompleteMultipartUpload { .. } => Some(Self::CompleteMultipartUpload),
            _ => None,
        }
    }

    /// Delete shaped commands take a storage lock while in flight.
    #[must_use]
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::DeleteObject | Self::DeleteObjects | Self::DeleteBucket)
    }
}

/// A deferred instruction to replay one client write against one replica.
///
/// The `nonce` identifies the logical operation across every retry; the
/// retry count only ever grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorTask {
    pub main_bucket_config: Bucket,
    pub backup_bucket_config: Bucket,
    pub command: MirrorCommand,
    pub original_request: ProxiedRequest,
    pub nonce: Uuid,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_body: Option<String>,
}

impl MirrorTask {
    /// Builds the task for one replica, or `None` when the op is not
    /// mirrored. The body travels base64 encoded.
    #[must_use]
    pub fn new(
        bucket: &Bucket,
        replica: &BackendRef,
        op: &S3Op,
        request: ProxiedRequest,
        body: &Bytes,
    ) -> Option<Self> {
        let command = MirrorCommand::from_op(op)?;
        Some(Self {
            main_bucket_config: bucket.clone(),
            backup_bucket_config: bucket.replica_view(replica),
            command,
            original_request: request,
            nonce: Uuid::new_v4(),
            retry_count: 0,
            string_body: (!body.is_empty()).then(|| base64_encode(body)),
        })
    }

    pub fn body_bytes(&self) -> HeraldResult<Bytes> {
        match self.string_body {
            Some(ref encoded) => base64_decode(encoded)
                .map(Bytes::from)
                .ok_or_else(|| invalid_request!("mirror task body is not valid base64")),
            None => Ok(Bytes::new()),
        }
    }

    /// Reconstructs the operation to replay from the command plus the
    /// captured request details.
    pub fn op(&self) -> HeraldResult<S3Op> {
        let op = match self.command {
            MirrorCommand::PutObject => S3Op::PutObject,
            MirrorCommand::DeleteObject => S3Op::DeleteObject,
            MirrorCommand::DeleteObjects => S3Op::DeleteObjects,
            MirrorCommand::CreateBucket => S3Op::CreateBucket,
            MirrorCommand::DeleteBucket => S3Op::DeleteBucket,
            MirrorCommand::CopyObject => {
                let raw = self
                    .original_request
                    .header(header::X_AMZ_COPY_SOURCE)
                    .ok_or_else(|| invalid_request!("copy task lost its x-amz-copy-source header"))?;
                S3Op::CopyObject {
                    source: CopySource::parse(raw)?,
                }
            }
            MirrorCommand::CompleteMultipartUpload => {
                let upload_id = self
                    .original_request
                    .query
                    .iter()
                    .find(|(name, _)| name == "uploadId")
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| invalid_request!("complete task lost its uploadId"))?;
                S3Op::CompleteMultipartUpload { upload_id }
            }
        };
        Ok(op)
    }

    /// Lock key for destructive replays on the backup target.
    #[must_use]
    pub fn storage_key(&self) -> String {
        let key = self.original_request.object_key.as_deref().unwrap_or("");
        format!(
            "{}/{}/{key}",
            self.backup_bucket_config.backend.name, self.backup_bucket_config.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{BackendConfig, S3BackendConfig, S3Credentials};

    fn bucket() -> Bucket {
        let backend = |name: &str| BackendRef {
            name: name.to_owned(),
            config: BackendConfig::S3(S3BackendConfig {
                endpoint: format!("http://{name}:9000"),
                region: "us-east-1".to_owned(),
                credentials: S3Credentials {
                    access_key_id: "AK".to_owned(),
                    secret_access_key: "SK".to_owned(),
                },
            }),
        };
        Bucket {
            name: "photos".to_owned(),
            backend: backend("main"),
            replicas: vec![backend("backup")],
        }
    }

    #[test]
    fn task_wire_format_round_trip() {
        let bucket = bucket();
        let request = ProxiedRequest {
            method: "PUT".to_owned(),
            object_key: Some("cats/tabby.jpg".to_owned()),
            query: Vec::new(),
            headers: vec![("content-type".to_owned(), "image/jpeg".to_owned())],
        };
        let body = Bytes::from_static(b"payload");
        let task = MirrorTask::new(&bucket, &bucket.replicas[0], &S3Op::PutObject, request, &body).unwrap();

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"mainBucketConfig\""));
        assert!(json.contains("\"retryCount\":0"));

        let decoded: MirrorTask = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, task);
        assert_eq!(decoded.body_bytes().unwrap(), body);
        assert_eq!(decoded.backup_bucket_config.backend.name, "backup");
        assert!(decoded.backup_bucket_config.replicas.is_empty());
    }

    #[test]
    fn non_mirrored_ops_make_no_task() {
        let bucket = bucket();
        let request = ProxiedRequest::default();
        assert!(MirrorTask::new(&bucket, &bucket.replicas[0], &S3Op::GetObject, request, &Bytes::new()).is_none());
    }

    #[test]
    fn op_reconstruction() {
        let bucket = bucket();
        let mut request = ProxiedRequest {
            method: "POST".to_owned(),
            object_key: Some("k".to_owned()),
            query: vec![("uploadId".to_owned(), "u-1".to_owned())],
            headers: Vec::new(),
        };
        let op = S3Op::CompleteMultipartUpload { upload_id: "u-1".to_owned() };
        let task = MirrorTask::new(&bucket, &bucket.replicas[0], &op, request.clone(), &Bytes::new()).unwrap();
        assert_eq!(task.op().unwrap(), op);

        request.headers.push((header::X_AMZ_COPY_SOURCE.to_owned(), "/src/k2".to_owned()));
        let op = S3Op::CopyObject {
            source: CopySource { bucket: "src".to_owned(), key: "k2".to_owned() },
        };
        let task = MirrorTask::new(&bucket, &bucket.replicas[0], &op, request, &Bytes::new()).unwrap();
        assert_eq!(task.op().unwrap(), op);
    }

    #[test]
    fn destructive_commands() {
        assert!(MirrorCommand::DeleteObjects.is_destructive());
        assert!(!MirrorCommand::PutObject.is_destructive());
    }
}
