use super::{check_response, content_type_for, file_body, uri_encode, Publisher};
use crate::{
    config::EnvVars,
    error::{Result, WorkerError},
    io::progress::{emit_transfer_progress, Transfer},
};
use reqwest::blocking::Client;
use std::path::Path;

#[derive(Clone)]
pub struct SupabaseCredentials {
    /// Project URL, e.g. `https://abc.supabase.co`.
    pub url: String,
    pub service_key: String,
}

impl SupabaseCredentials {
    pub fn from_env(env: &EnvVars) -> Result<Self> {
        let url = env.require("SUPABASE_URL")?.trim_end_matches('/').to_string();
        let service_key = env
            .get("SUPABASE_SERVICE_KEY")
            .or_else(|| env.get("SUPABASE_KEY"))
            .ok_or_else(|| WorkerError::MissingCredentials("SUPABASE_SERVICE_KEY".into()))?
            .to_string();
        Ok(Self { url, service_key })
    }
}

impl std::fmt::Debug for SupabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseCredentials")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Supabase Storage over its REST API.
pub struct SupabasePublisher {
    client: Client,
    creds: SupabaseCredentials,
    bucket: String,
}

impl SupabasePublisher {
    pub fn new(client: Client, creds: SupabaseCredentials, bucket: &str) -> Self {
        Self {
            client,
            creds,
            bucket: bucket.to_string(),
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!(
            "{}/{}",
            uri_encode(&self.bucket, false),
            uri_encode(key, true)
        )
    }
}

impl Publisher for SupabasePublisher {
    fn publish(&self, file: &Path, key: &str) -> Result<String> {
        let url = format!(
            "{}/storage/v1/object/{}",
            self.creds.url,
            self.object_path(key)
        );
        tracing::debug!(bucket = %self.bucket, key, "uploading to supabase storage");

        let (body, len) = file_body(file).map_err(|e| WorkerError::publish(key, e))?;
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.creds.service_key)
            .header("apikey", &self.creds.service_key)
            .header("content-type", content_type_for(file))
            .header("x-upsert", "true")
            .body(body)
            .send()
            .map_err(|e| WorkerError::publish(key, e))?;
        check_response(resp, key)?;

        emit_transfer_progress(Transfer::Upload, len, len);
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}",
            self.creds.url,
            self.object_path(key)
        )
    }

    fn name(&self) -> &'static str {
        "supabase"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_falls_back_to_generic_key() {
        let env = EnvVars::from_pairs([
            ("SUPABASE_URL", "https://abc.supabase.co/"),
            ("SUPABASE_KEY", "k"),
        ]);
        let c = SupabaseCredentials::from_env(&env).unwrap();
        assert_eq!(c.url, "https://abc.supabase.co");
        assert_eq!(c.service_key, "k");

        let no_key = EnvVars::from_pairs([("SUPABASE_URL", "https://abc.supabase.co")]);
        assert!(matches!(
            SupabaseCredentials::from_env(&no_key),
            Err(WorkerError::MissingCredentials(ref v)) if v == "SUPABASE_SERVICE_KEY"
        ));
    }

    #[test]
    fn public_url_layout() {
        let p = SupabasePublisher::new(
            Client::new(),
            SupabaseCredentials {
                url: "https://abc.supabase.co".into(),
                service_key: "k".into(),
            },
            "stems",
        );
        assert_eq!(
            p.public_url("demucs-outputs/ab12cd34/drums.mp3"),
            "https://abc.supabase.co/storage/v1/object/public/stems/demucs-outputs/ab12cd34/drums.mp3"
        );
    }
}
