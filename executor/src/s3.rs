use anyhow::{Context, Result};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;

use crate::args::S3Args;

/// Create an S3 client for the configured endpoint. Path-style addressing
/// is required by most S3-compatible stores.
pub async fn create_client(args: &S3Args) -> S3Client {
    let credentials = Credentials::new(
        args.access_key_id.clone(),
        args.secret_access_key.clone(),
        None,
        None,
        "opr-executor",
    );
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(args.region.clone()))
        .endpoint_url(&args.endpoint)
        .credentials_provider(credentials)
        .load()
        .await;
    let s3_config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(true)
        .build();
    S3Client::from_conf(s3_config)
}

/// Download an object fully into memory.
pub async fn get_object(client: &S3Client, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let response = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("failed to get object {key} from S3"))?;

    let body = response
        .body
        .collect()
        .await
        .context("failed to read S3 object body")?;

    Ok(body.into_bytes().to_vec())
}

/// Size of an object in bytes.
pub async fn head_object(client: &S3Client, bucket: &str, key: &str) -> Result<i64> {
    let response = client
        .head_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("failed to head object {key} in S3"))?;

    Ok(response.content_length().unwrap_or(0))
}
