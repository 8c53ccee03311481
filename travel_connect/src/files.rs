use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name and content type recorded next to each stored file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub mime: String,
    pub name: String,
}

/// Media URL under which a stored file is served.
pub fn media_url(id: &str) -> String {
    format!("/api/files/{id}")
}

/// File ids are lowercase sha256 hex digests.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Save file data into a content-addressed store and return its hash id.
pub async fn save_file<P: AsRef<Path>>(base: P, data: Bytes, meta: &FileMeta) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let dir = base.as_ref().join(&hash[..2]);
    fs::create_dir_all(&dir).await?;
    fs::write(dir.join(&hash), data).await?;
    fs::write(dir.join(format!("{hash}.meta")), serde_json::to_vec(meta)?).await?;
    tracing::debug!(file = %hash, mime = %meta.mime, "stored media");
    Ok(hash)
}

/// On-disk path for a file id, `None` for malformed ids.
pub fn file_path<P: AsRef<Path>>(base: P, id: &str) -> Option<PathBuf> {
    if !is_valid_id(id) {
        return None;
    }
    Some(base.as_ref().join(&id[..2]).join(id))
}

pub async fn load_meta<P: AsRef<Path>>(base: P, id: &str) -> Option<FileMeta> {
    let path = file_path(base, id)?.with_extension("meta");
    let bytes = fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FileMeta {
        FileMeta {
            mime: "image/png".into(),
            name: "beach.png".into(),
        }
    }

    #[tokio::test]
    async fn saves_and_paths_file() {
        let tmp = tempfile::tempdir().unwrap();
        let id = save_file(tmp.path(), Bytes::from_static(b"hello"), &meta())
            .await
            .unwrap();
        let expected = file_path(tmp.path(), &id).unwrap();
        assert!(expected.exists());
        assert!(expected.parent().unwrap().ends_with(&id[..2]));
        assert_eq!(load_meta(tmp.path(), &id).await, Some(meta()));
        assert_eq!(media_url(&id), format!("/api/files/{id}"));
    }

    #[tokio::test]
    async fn same_content_same_id() {
        let tmp = tempfile::tempdir().unwrap();
        let a = save_file(tmp.path(), Bytes::from_static(b"x"), &meta()).await.unwrap();
        let b = save_file(tmp.path(), Bytes::from_static(b"x"), &meta()).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(file_path("/tmp", "a").is_none());
        assert!(file_path("/tmp", "../../etc/passwd").is_none());
        assert!(!is_valid_id(&"G".repeat(64)));
        assert!(is_valid_id(&"ab".repeat(32)));
    }
}
