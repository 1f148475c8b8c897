use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::sync::Arc;

use super::object_store::ObjectStore;
use super::uri::ObjectUri;

/// ObjectStore implementation for S3
#[derive(Clone)]
pub struct S3ObjectStore {
    s3_client: Arc<S3Client>,
}

impl S3ObjectStore {
    pub fn new(s3_client: Arc<S3Client>) -> Self {
        Self { s3_client }
    }

    /// Build a client from the default AWS credential and region chain
    pub async fn from_env() -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Arc::new(S3Client::new(&aws_config)))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Bytes> {
        let response = self
            .s3_client
            .get_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .send()
            .await
            .with_context(|| format!("Failed to get S3 object {}", uri))?;

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to collect S3 response body")?
            .into_bytes();

        Ok(bytes)
    }

    async fn put(&self, uri: &ObjectUri, body: Bytes) -> Result<ObjectUri> {
        self.s3_client
            .put_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("Failed to put S3 object {}", uri))?;

        Ok(uri.clone())
    }

    async fn exists(&self, uri: &ObjectUri) -> Result<bool> {
        let result = self
            .s3_client
            .head_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to get S3 object metadata for {}", uri))
            }
        }
    }

    async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>> {
        let key_prefix = if prefix.key().is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.key())
        };

        let mut pages = self
            .s3_client
            .list_objects_v2()
            .bucket(prefix.bucket())
            .prefix(key_prefix)
            .into_paginator()
            .send();

        let mut found = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("Failed to list S3 prefix {}", prefix))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    found.push(ObjectUri::new(prefix.bucket(), key));
                }
            }
        }

        found.sort();
        Ok(found)
    }
}
