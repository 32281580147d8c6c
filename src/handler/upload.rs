//! Upload handling module
//!
//! Parses a `multipart/form-data` body, validates the single file part against
//! the extension allow-list and streams it into [`Storage`].

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use multer::{Constraints, Multipart, SizeLimit};
use std::ffi::OsStr;
use std::path::Path;

use crate::config::StorageConfig;
use crate::storage::{PendingWrite, Storage};

/// Accepted extensions, compared case-insensitively
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["jpeg", "jpg", "png", "gif", "txt", "pdf"];

/// Reasons an upload is refused
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid file type. Only images, txt, and pdf are allowed (jpeg, jpg, png, gif, txt, pdf).")]
    InvalidFileType { extension: Option<String> },

    #[error("{0}")]
    MalformedRequest(String),

    #[error("failed to store upload: {0}")]
    StorageFailure(#[from] std::io::Error),

    #[error("upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("{0}")]
    Other(String),
}

impl From<multer::Error> for UploadError {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::StreamSizeExceeded { limit }
            | multer::Error::FieldSizeExceeded { limit, .. } => Self::PayloadTooLarge { limit },
            multer::Error::StreamReadFailed(e) => Self::Other(e.to_string()),
            other => Self::MalformedRequest(other.to_string()),
        }
    }
}

/// A file accepted and persisted by [`UploadHandler::accept`]
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client supplied, never used as a path
    pub original_name: String,
    /// Client supplied, advisory only
    pub content_type: Option<String>,
    pub stored_name: String,
    pub size: u64,
}

/// Check `file_name`'s extension against [`ALLOWED_EXTENSIONS`].
///
/// Returns the extension as supplied (case preserved).
pub fn validate_extension(file_name: &str) -> Result<&str, UploadError> {
    let extension = Path::new(file_name).extension().and_then(OsStr::to_str);
    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)) => Ok(ext),
        other => Err(UploadError::InvalidFileType {
            extension: other.map(str::to_owned),
        }),
    }
}

/// Upload endpoint logic, independent of routing
#[derive(Debug, Clone)]
pub struct UploadHandler {
    storage: Storage,
    field_name: String,
    max_body_size: u64,
}

impl UploadHandler {
    pub fn new(storage: Storage, config: &StorageConfig, max_body_size: u64) -> Self {
        Self {
            storage,
            field_name: config.field_name.clone(),
            max_body_size,
        }
    }

    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Consume a multipart request and persist its single file part.
    ///
    /// The file is only renamed into place once the whole body has been read,
    /// so a rejected request never leaves anything behind.
    pub async fn accept<B>(&self, req: Request<B>) -> Result<UploadedFile, UploadError>
    where
        B: Body + Send + 'static,
        B::Data: Into<Bytes> + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadError::MalformedRequest("Missing Content-Type header".into()))?;
        let boundary = multer::parse_boundary(content_type)?;

        let constraints =
            Constraints::new().size_limit(SizeLimit::new().whole_stream(self.max_body_size));
        let mut multipart =
            Multipart::with_constraints(req.into_body().into_data_stream(), boundary, constraints);

        let mut pending: Option<(PendingWrite, UploadedFile)> = None;
        let read = self.read_parts(&mut multipart, &mut pending).await;

        match (read, pending) {
            (Ok(()), Some((write, mut file))) => {
                file.size = write.finish().await?;
                Ok(file)
            }
            (Ok(()), None) => Err(UploadError::MalformedRequest(format!(
                "Missing file field '{}'",
                self.field_name
            ))),
            (Err(err), Some((write, _))) => {
                write.abort().await;
                Err(err)
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Stream every part, leaving the accepted file in `pending`.
    ///
    /// Whatever is in `pending` when this fails is discarded by the caller.
    async fn read_parts(
        &self,
        multipart: &mut Multipart<'_>,
        pending: &mut Option<(PendingWrite, UploadedFile)>,
    ) -> Result<(), UploadError> {
        while let Some(mut field) = multipart.next_field().await? {
            // Parts without a filename are plain form values
            let Some(original_name) = field.file_name().map(str::to_owned) else {
                continue;
            };

            let field_name = field.name().unwrap_or_default().to_owned();
            if pending.is_some() || field_name != self.field_name {
                return Err(UploadError::MalformedRequest(format!(
                    "Unexpected field '{field_name}'"
                )));
            }

            let extension = validate_extension(&original_name)?;
            let stored_name = Storage::generate_name(extension);
            let write = self.storage.begin(&stored_name).await?;
            let file = UploadedFile {
                content_type: field.content_type().map(ToString::to_string),
                original_name,
                stored_name,
                size: 0,
            };
            let (write, _) = pending.insert((write, file));

            while let Some(chunk) = field.chunk().await? {
                write.write(&chunk).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http_body_util::Full;

    pub const BOUNDARY: &str = "X-TEST-BOUNDARY";

    /// Part description: (field name, optional filename, content)
    pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

    pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(f) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                }
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    pub fn multipart_request(parts: &[Part<'_>]) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Full::new(Bytes::from(multipart_body(parts))))
            .unwrap()
    }

    pub fn stored_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn handler(dir: &Path) -> UploadHandler {
        let storage = Storage::init(dir).await.unwrap();
        UploadHandler::new(storage, &StorageConfig::default(), 1024)
    }

    #[test]
    fn test_validate_extension() {
        assert_eq!(validate_extension("photo.PNG").unwrap(), "PNG");
        assert_eq!(validate_extension("a.b.jpeg").unwrap(), "jpeg");
        assert_eq!(validate_extension("../../etc/notes.txt").unwrap(), "txt");
        assert_eq!(validate_extension("Report.Pdf").unwrap(), "Pdf");

        for bad in ["virus.exe", "archive.zip", "noext", ".png", "photo.", "photo.pngx"] {
            assert!(
                matches!(
                    validate_extension(bad),
                    Err(UploadError::InvalidFileType { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_accept_stores_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = multipart_request(&[
            ("note", None, b"ignored text field"),
            ("myfile", Some("photo.PNG"), b"0123456789"),
        ]);
        let file = handler.accept(req).await.unwrap();

        assert_eq!(file.original_name, "photo.PNG");
        assert_eq!(file.size, 10);
        assert!(file.stored_name.ends_with(".PNG"));
        assert_eq!(file.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(stored_files(dir.path()), vec![file.stored_name.clone()]);
        assert_eq!(
            std::fs::read(dir.path().join(&file.stored_name)).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn test_rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = multipart_request(&[("myfile", Some("virus.exe"), b"MZ")]);
        let err = handler.accept(req).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::InvalidFileType { extension: Some(ref e) } if e == "exe"
        ));
        assert!(err.to_string().starts_with("Invalid file type"));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = multipart_request(&[("myfile", None, b"just text")]);
        let err = handler.accept(req).await.unwrap_err();
        assert!(matches!(err, UploadError::MalformedRequest(ref m) if m.contains("myfile")));
    }

    #[tokio::test]
    async fn test_non_multipart_body() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(b"{\"a\":1}")))
            .unwrap();
        assert!(matches!(
            handler.accept(req).await,
            Err(UploadError::MalformedRequest(_))
        ));

        let req = Request::builder()
            .method("POST")
            .body(Full::new(Bytes::from_static(b"raw")))
            .unwrap();
        assert!(matches!(
            handler.accept(req).await,
            Err(UploadError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_multipart_body() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = Request::builder()
            .method("POST")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Full::new(Bytes::from_static(b"this is not multipart")))
            .unwrap();
        assert!(matches!(
            handler.accept(req).await,
            Err(UploadError::MalformedRequest(_))
        ));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_second_file_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = multipart_request(&[
            ("myfile", Some("a.txt"), b"first"),
            ("myfile", Some("b.txt"), b"second"),
        ]);
        let err = handler.accept(req).await.unwrap_err();
        assert!(matches!(err, UploadError::MalformedRequest(ref m) if m.contains("Unexpected")));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_file_under_other_field_name() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let req = multipart_request(&[("avatar", Some("a.png"), b"png")]);
        let err = handler.accept(req).await.unwrap_err();
        assert!(matches!(err, UploadError::MalformedRequest(ref m) if m.contains("avatar")));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("uploads");
        let handler = handler(&dir).await;
        std::fs::remove_dir(&dir).unwrap();

        let req = multipart_request(&[("myfile", Some("a.txt"), b"data")]);
        assert!(matches!(
            handler.accept(req).await,
            Err(UploadError::StorageFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_body_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let big = vec![b'a'; 4096];
        let req = multipart_request(&[("myfile", Some("big.txt"), &big)]);
        assert!(matches!(
            handler.accept(req).await,
            Err(UploadError::PayloadTooLarge { limit: 1024 })
        ));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path()).await;

        let (a, b) = tokio::join!(
            handler.accept(multipart_request(&[("myfile", Some("a.txt"), b"a")])),
            handler.accept(multipart_request(&[("myfile", Some("b.txt"), b"b")])),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.stored_name, b.stored_name);
        assert_eq!(stored_files(dir.path()).len(), 2);
    }
}
