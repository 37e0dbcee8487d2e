use super::{check_response, content_type_for, file_body, uri_encode, Publisher};
use crate::{
    config::EnvVars,
    error::{Result, WorkerError},
    io::{
        crypto::sha256_file,
        progress::{emit_transfer_progress, Transfer},
    },
};
use aws_credential_types::Credentials;
use aws_sigv4::{
    http_request::{
        sign, PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest,
        SigningSettings, UriPathNormalizationMode,
    },
    sign::v4,
};
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::{blocking::Client, Url};
use std::{path::Path, time::SystemTime};

#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    /// S3-compatible endpoint; path-style addressing is used when set.
    pub endpoint: Option<String>,
}

impl S3Credentials {
    pub fn from_env(env: &EnvVars) -> Result<Self> {
        Ok(Self {
            access_key_id: env.require("AWS_ACCESS_KEY_ID")?.to_string(),
            secret_access_key: env.require("AWS_SECRET_ACCESS_KEY")?.to_string(),
            session_token: env.get("AWS_SESSION_TOKEN").map(str::to_string),
            region: env.get("AWS_REGION").unwrap_or("us-east-1").to_string(),
            endpoint: env
                .get("S3_ENDPOINT_URL")
                .map(|e| e.trim_end_matches('/').to_string()),
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

pub struct S3Publisher {
    client: Client,
    creds: S3Credentials,
    bucket: String,
}

impl S3Publisher {
    pub fn new(client: Client, creds: S3Credentials, bucket: &str) -> Self {
        Self {
            client,
            creds,
            bucket: bucket.to_string(),
        }
    }

    /// Request URL; path-style when a custom endpoint is configured.
    fn target(&self, key: &str) -> String {
        let key = uri_encode(key, true);
        match &self.creds.endpoint {
            Some(endpoint) => format!("{endpoint}/{}/{key}", uri_encode(&self.bucket, false)),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.bucket, self.creds.region
            ),
        }
    }

    /// Headers for a signed, public-read `PUT` of an object whose body
    /// hashes to `payload_hash`.
    fn signed_headers(
        &self,
        url: &Url,
        content_type: &str,
        payload_hash: &str,
        time: SystemTime,
    ) -> std::result::Result<Vec<(String, String)>, String> {
        let identity: Identity = Credentials::new(
            &self.creds.access_key_id,
            &self.creds.secret_access_key,
            self.creds.session_token.clone(),
            None,
            "stem-worker",
        )
        .into();

        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        settings.percent_encoding_mode = PercentEncodingMode::Single;
        settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.creds.region)
            .name("s3")
            .time(time)
            .settings(settings)
            .build()
            .map_err(|e| e.to_string())?
            .into();

        let mut headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("x-amz-acl".to_string(), "public-read".to_string()),
        ];
        let request = SignableRequest::new(
            "PUT",
            url.as_str(),
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::Precomputed(payload_hash.to_string()),
        )
        .map_err(|e| e.to_string())?;

        let (instructions, _signature) = sign(request, &params)
            .map_err(|e| e.to_string())?
            .into_parts();
        headers.extend(
            instructions
                .headers()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        Ok(headers)
    }

    fn put(&self, file: &Path, key: &str, time: SystemTime) -> Result<()> {
        let url = Url::parse(&self.target(key)).map_err(|e| WorkerError::publish(key, e))?;

        let payload_hash = sha256_file(file).map_err(|e| WorkerError::publish(key, e))?;
        let headers = self
            .signed_headers(&url, content_type_for(file), &payload_hash, time)
            .map_err(|e| WorkerError::publish(key, format!("signing failed: {e}")))?;

        let (body, len) = file_body(file).map_err(|e| WorkerError::publish(key, e))?;

        let mut req = self.client.put(url);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let resp = req.body(body).send().map_err(|e| WorkerError::publish(key, e))?;
        check_response(resp, key)?;
        emit_transfer_progress(Transfer::Upload, len, len);
        Ok(())
    }
}

impl Publisher for S3Publisher {
    fn publish(&self, file: &Path, key: &str) -> Result<String> {
        tracing::debug!(bucket = %self.bucket, key, "uploading to s3");
        self.put(file, key, SystemTime::now())?;
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        let key = uri_encode(key, true);
        match &self.creds.endpoint {
            Some(endpoint) => format!("{endpoint}/{}/{key}", self.bucket),
            None => format!("https://{}.s3.amazonaws.com/{key}", self.bucket),
        }
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
