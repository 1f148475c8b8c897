use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use url::Url;

/// Location of an object in the object store, rendered as `s3://bucket/key`
///
/// The key may be empty or a prefix; `join` appends `/`-separated segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectUri {
    bucket: String,
    key: String,
}

impl ObjectUri {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let key: String = key.into();
        Self {
            bucket: bucket.into(),
            key: key.trim_matches('/').to_string(),
        }
    }

    /// Parse an `s3://bucket/key` string
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| anyhow!("Invalid object URI {}: {}", uri, e))?;
        if url.scheme() != "s3" {
            return Err(anyhow!("Not an object URI (expected s3://): {}", uri));
        }
        Self::from_url(&url, uri)
    }

    fn from_url(url: &Url, raw: &str) -> Result<Self> {
        let bucket = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("Object URI missing bucket: {}", raw))?
            .to_string();

        // Remove leading '/' from path
        let key = url.path().trim_start_matches('/').to_string();

        if key.is_empty() {
            return Err(anyhow!("Object URI missing key: {}", raw));
        }

        Ok(Self::new(bucket, key))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a relative path below this URI
    pub fn join(&self, segment: impl AsRef<str>) -> ObjectUri {
        let segment = segment.as_ref().trim_matches('/');
        let key = match (self.key.is_empty(), segment.is_empty()) {
            (_, true) => self.key.clone(),
            (true, false) => segment.to_string(),
            (false, false) => format!("{}/{}", self.key, segment),
        };
        ObjectUri {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// The URI one segment up, or `None` at the bucket root
    pub fn parent(&self) -> Option<ObjectUri> {
        if self.key.is_empty() {
            return None;
        }
        let key = match self.key.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        Some(ObjectUri {
            bucket: self.bucket.clone(),
            key,
        })
    }

    /// Last segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// Key relative to `prefix`, if this URI lives below it
    pub fn strip_prefix(&self, prefix: &ObjectUri) -> Option<&str> {
        if self.bucket != prefix.bucket {
            return None;
        }
        if prefix.key.is_empty() {
            return Some(&self.key);
        }
        self.key
            .strip_prefix(prefix.key.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}

impl TryFrom<String> for ObjectUri {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        ObjectUri::parse(&value)
    }
}

impl From<ObjectUri> for String {
    fn from(uri: ObjectUri) -> Self {
        uri.to_string()
    }
}

/// A reference to a file wherever it currently lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FileReference {
    LocalPath(PathBuf),
    HttpUrl(Url),
    ObjectUri(ObjectUri),
}

impl FileReference {
    /// Parse a reference; anything that is not a URL is a local path
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(anyhow!("Empty file reference"));
        }

        match Url::parse(raw) {
            // Single-letter schemes are Windows drive letters
            Ok(url) if url.scheme().len() > 1 => match url.scheme() {
                "s3" => Ok(FileReference::ObjectUri(ObjectUri::from_url(&url, raw)?)),
                "http" | "https" => Ok(FileReference::HttpUrl(url)),
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| anyhow!("Invalid file:// URI: {}", raw))?;
                    Ok(FileReference::LocalPath(path))
                }
                scheme => Err(anyhow!("Unsupported URI scheme: {}", scheme)),
            },
            _ => Ok(FileReference::LocalPath(PathBuf::from(raw))),
        }
    }

    pub fn local(path: impl AsRef<Path>) -> Self {
        FileReference::LocalPath(path.as_ref().to_path_buf())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, FileReference::LocalPath(_))
    }

    /// File name of the referenced file, if it has one
    pub fn file_name(&self) -> Option<String> {
        let name = match self {
            FileReference::LocalPath(path) => path.file_name()?.to_string_lossy().into_owned(),
            FileReference::HttpUrl(url) => url.path_segments()?.next_back()?.to_string(),
            FileReference::ObjectUri(uri) => uri.file_name().to_string(),
        };
        (!name.is_empty()).then_some(name)
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileReference::LocalPath(path) => write!(f, "{}", path.display()),
            FileReference::HttpUrl(url) => write!(f, "{}", url),
            FileReference::ObjectUri(uri) => write!(f, "{}", uri),
        }
    }
}

impl TryFrom<String> for FileReference {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        FileReference::parse(&value)
    }
}

impl From<FileReference> for String {
    fn from(reference: FileReference) -> Self {
        reference.to_string()
    }
}

impl From<ObjectUri> for FileReference {
    fn from(uri: ObjectUri) -> Self {
        FileReference::ObjectUri(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_uri() {
        let uri = ObjectUri::parse("s3://my-bucket/path/to/file.pq").unwrap();
        assert_eq!(uri.bucket(), "my-bucket");
        assert_eq!(uri.key(), "path/to/file.pq");
        assert_eq!(uri.file_name(), "file.pq");
        assert_eq!(uri.to_string(), "s3://my-bucket/path/to/file.pq");
    }

    #[test]
    fn test_parse_object_uri_missing_parts() {
        assert!(ObjectUri::parse("s3:///file.pq").is_err());
        assert!(ObjectUri::parse("s3://bucket/").is_err());
        assert!(ObjectUri::parse("https://host/file.pq").is_err());
    }

    #[test]
    fn test_join_and_parent() {
        let root = ObjectUri::new("bucket", "");
        let exp = root.join("sweep").join("/task/v1.0.0/");
        assert_eq!(exp.to_string(), "s3://bucket/sweep/task/v1.0.0");
        assert_eq!(exp.parent().unwrap().to_string(), "s3://bucket/sweep/task");
        assert_eq!(
            ObjectUri::new("bucket", "top").parent().unwrap(),
            ObjectUri::new("bucket", "")
        );
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_strip_prefix() {
        let prefix = ObjectUri::new("bucket", "sweep/task");
        let uri = ObjectUri::new("bucket", "sweep/task/v1.2.3/x/manifest.yml");
        assert_eq!(uri.strip_prefix(&prefix), Some("v1.2.3/x/manifest.yml"));

        let sibling = ObjectUri::new("bucket", "sweep/task-other/v1.0.0");
        assert_eq!(sibling.strip_prefix(&prefix), None);
    }

    #[test]
    fn test_parse_file_references() {
        assert!(matches!(
            FileReference::parse("s3://bucket/a/b.epw").unwrap(),
            FileReference::ObjectUri(_)
        ));
        assert!(matches!(
            FileReference::parse("https://example.com/data/b.epw").unwrap(),
            FileReference::HttpUrl(_)
        ));
        assert!(matches!(
            FileReference::parse("/data/b.epw").unwrap(),
            FileReference::LocalPath(_)
        ));
        assert!(matches!(
            FileReference::parse("data/b.epw").unwrap(),
            FileReference::LocalPath(_)
        ));
        assert_eq!(
            FileReference::parse("file:///data/b.epw").unwrap(),
            FileReference::LocalPath(PathBuf::from("/data/b.epw"))
        );
    }

    #[test]
    fn test_parse_unsupported_scheme() {
        assert!(FileReference::parse("ftp://host/file").is_err());
        assert!(FileReference::parse("").is_err());
    }

    #[test]
    fn test_file_reference_file_name() {
        let http = FileReference::parse("https://example.com/weather/chicago.epw").unwrap();
        assert_eq!(http.file_name().as_deref(), Some("chicago.epw"));

        let object = FileReference::parse("s3://bucket/weather/boston.epw").unwrap();
        assert_eq!(object.file_name().as_deref(), Some("boston.epw"));
    }

    #[test]
    fn test_serde_as_string() {
        let reference = FileReference::parse("s3://bucket/key.txt").unwrap();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"s3://bucket/key.txt\"");
        let back: FileReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
