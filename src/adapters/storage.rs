use crate::config::toml_config::ObjectStoreConfig;
use crate::domain::ports::ObjectStore;
use crate::utils::error::{EtlError, Result};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// 預設憑證鏈；有設定 endpoint 或金鑰時覆寫
    pub async fn from_config(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "saas-etl-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(S3Client::from_conf(builder.build()), config.bucket.clone())
    }
}

impl ObjectStore for S3Storage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.to_vec().into())
            .send()
            .await
            .map_err(|e| EtlError::UploadError {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(bucket = %self.bucket, key, "Uploaded {} bytes", data.len());
        Ok(())
    }

    fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
