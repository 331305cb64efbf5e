//! S3 wire documents.
//!
//! Hand-written counterparts of the S3 XML schemas Herald speaks. Request
//! bodies (`Delete`, `CompleteMultipartUpload`) are deserialized from client
//! payloads; the result types are serialized into responses, notably when the
//! Swift resolver synthesizes S3 answers from Swift listings.

use serde::{Deserialize, Serialize};

use crate::error::HeraldResult;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

pub fn to_xml<T: Serialize>(value: &T) -> HeraldResult<String> {
    let body = quick_xml::se::to_string(value).map_err(crate::error::HeraldError::internal)?;
    Ok(format!("{XML_DECL}{body}"))
}

pub fn from_xml<'de, T: Deserialize<'de>>(input: &'de str) -> HeraldResult<T> {
    quick_xml::de::from_str(input).map_err(|e| invalid_request!("malformed xml body: {e}"))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Error")]
pub struct ErrorBody {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "ErrorSource")]
    pub error_source: String,
    #[serde(rename = "RequestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Bucket")]
pub struct BucketEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CreationDate")]
    pub creation_date: String,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Buckets {
    #[serde(rename = "Bucket", default)]
    pub bucket: Vec<BucketEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "ListAllMyBucketsResult")]
pub struct ListAllMyBucketsResult {
    #[serde(rename = "Owner")]
    pub owner: Owner,
    #[serde(rename = "Buckets")]
    pub buckets: Buckets,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Contents")]
pub struct ObjectEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "StorageClass")]
    pub storage_class: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketResult {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "KeyCount")]
    pub key_count: u64,
    #[serde(rename = "MaxKeys")]
    pub max_keys: u64,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ObjectEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Object")]
pub struct ObjectIdentifier {
    #[serde(rename = "Key")]
    pub key: String,
}

/// Request body of `DeleteObjects`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Delete")]
pub struct DeleteRequest {
    #[serde(rename = "Object", default)]
    pub objects: Vec<ObjectIdentifier>,
    #[serde(rename = "Quiet", default)]
    pub quiet: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Deleted")]
pub struct DeletedObject {
    #[serde(rename = "Key")]
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Error")]
pub struct DeleteErrorEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "DeleteResult")]
pub struct DeleteResult {
    #[serde(rename = "Deleted", default)]
    pub deleted: Vec<DeletedObject>,
    #[serde(rename = "Error", default)]
    pub errors: Vec<DeleteErrorEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "InitiateMultipartUploadResult")]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "Part")]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Request body of `CompleteMultipartUpload`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUploadRequest {
    #[serde(rename = "Part", default)]
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "CompleteMultipartUploadResult")]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "CopyObjectResult")]
pub struct CopyObjectResult {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "CopyPartResult")]
pub struct CopyPartResult {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_round_trip() {
        let body = ErrorBody {
            code: "NoSuchKey".to_owned(),
            message: "The specified key does not exist.".to_owned(),
            error_source: "S3 Server".to_owned(),
            request_id: None,
        };
        let xml = to_xml(&body).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<Error><Code>NoSuchKey</Code>"));
        assert!(!xml.contains("RequestId"));
    }

    #[test]
    fn delete_request_parses_multiple_objects() {
        let input = r"<Delete>
            <Object><Key>a.txt</Key></Object>
            <Object><Key>b/c.txt</Key></Object>
            <Quiet>true</Quiet>
        </Delete>";
        let parsed: DeleteRequest = from_xml(input).unwrap();
        assert_eq!(parsed.objects.len(), 2);
        assert_eq!(parsed.objects[1].key, "b/c.txt");
        assert_eq!(parsed.quiet, Some(true));
    }

    #[test]
    fn complete_multipart_request_preserves_part_order() {
        let input = r"<CompleteMultipartUpload>
            <Part><PartNumber>2</PartNumber><ETag>etag-2</ETag></Part>
            <Part><PartNumber>1</PartNumber><ETag>etag-1</ETag></Part>
        </CompleteMultipartUpload>";
        let parsed: CompleteMultipartUploadRequest = from_xml(input).unwrap();
        assert_eq!(parsed.parts[0].part_number, 2);
        assert_eq!(parsed.parts[1].part_number, 1);
    }

    #[test]
    fn delete_result_lists_deleted_and_failed() {
        let result = DeleteResult {
            deleted: vec![DeletedObject { key: "a".to_owned() }],
            errors: vec![DeleteErrorEntry {
                key: "b".to_owned(),
                code: "InternalError".to_owned(),
                message: "backend failure".to_owned(),
            }],
        };
        let xml = to_xml(&result).unwrap();
        assert!(xml.contains("<Deleted><Key>a</Key></Deleted>"));
        assert!(xml.contains("<Error><Key>b</Key>"));
    }

    #[test]
    fn malformed_body_is_a_client_error() {
        let err = from_xml::<DeleteRequest>("<Delete><Object>").unwrap_err();
        assert_eq!(err.code(), crate::error::HeraldErrorCode::InvalidRequest);
    }
}
