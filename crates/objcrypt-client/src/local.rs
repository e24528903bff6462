//! Local-directory transport used by the CLI
//!
//! Layout under the root:
//! ```text
//! objects/<key>            record: header, metadata JSON, object bytes
//! uploads/<id>/upload.json pending multipart upload (key + metadata)
//! uploads/<id>/<n>.part    uploaded part n
//! ```
//!
//! An object record is `OBJ1`, a big-endian u32 metadata length, the
//! metadata JSON, then the body. Bodies stream through a temp file in the
//! destination directory; one rename publishes body and metadata together.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use objcrypt_core::{CryptoError, CryptoResult, ObjectMetadata};
use tempfile::NamedTempFile;

use crate::transport::{
    check_length, clamp_range, GetObjectOutput, HeadObjectOutput, ObjectTransport, UploadBody,
};

const RECORD_MAGIC: &[u8; 4] = b"OBJ1";

#[derive(Debug, Clone)]
pub struct LocalFsTransport {
    root: PathBuf,
    bucket: String,
}

impl LocalFsTransport {
    pub fn new(root: impl Into<PathBuf>) -> CryptoResult<Self> {
        let root = root.into();
        for dir in ["objects", "uploads"] {
            fs::create_dir_all(root.join(dir))?;
        }
        let bucket = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".into());
        tracing::debug!(root = %root.display(), "local transport ready");
        Ok(Self { root, bucket })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> CryptoResult<PathBuf> {
        Ok(self.root.join("objects").join(checked_key(key)?))
    }

    fn upload_dir(&self, upload_id: &str) -> CryptoResult<PathBuf> {
        let valid = !upload_id.is_empty()
            && upload_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(CryptoError::NotFound(format!("upload {upload_id}")));
        }
        let dir = self.root.join("uploads").join(upload_id);
        if !dir.is_dir() {
            return Err(CryptoError::NotFound(format!("upload {upload_id}")));
        }
        Ok(dir)
    }

    /// Temp file next to the object's final path, header already written.
    fn begin_record(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<(PathBuf, NamedTempFile)> {
        let path = self.object_path(key)?;
        let mut record = temp_beside(&path)?;
        let json = encode_metadata(metadata)?;
        let json_len = u32::try_from(json.len())
            .map_err(|_| CryptoError::Transport(format!("metadata of {key} too large")))?;
        let file = record.as_file_mut();
        file.write_all(RECORD_MAGIC)?;
        file.write_all(&json_len.to_be_bytes())?;
        file.write_all(&json)?;
        Ok((path, record))
    }

    /// Open an object record positioned at the start of its body.
    fn open_record(&self, key: &str) -> CryptoResult<Record> {
        let path = self.object_path(key)?;
        let mut file = File::open(&path).map_err(|e| not_found(key, e))?;
        let file_len = file.metadata()?.len();

        let corrupt = || CryptoError::Transport(format!("corrupt object record for {key}"));
        let mut header = [0u8; 8];
        file.read_exact(&mut header).map_err(|_| corrupt())?;
        if &header[..4] != RECORD_MAGIC {
            return Err(corrupt());
        }
        let json_len = u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));
        let body_offset = 8 + json_len;
        if body_offset > file_len {
            return Err(corrupt());
        }
        let mut json = Vec::new();
        (&mut file).take(json_len).read_to_end(&mut json)?;
        Ok(Record {
            file,
            metadata: decode_metadata(&json)?,
            body_offset,
            body_len: file_len - body_offset,
        })
    }

    fn read_upload(&self, dir: &Path) -> CryptoResult<(String, ObjectMetadata)> {
        let bytes = fs::read(dir.join("upload.json"))?;
        let mut record = decode_metadata(&bytes)?;
        let key = record.remove(UPLOAD_KEY_FIELD).ok_or_else(|| {
            CryptoError::Transport(format!("corrupt upload record in {}", dir.display()))
        })?;
        Ok((key, record))
    }
}

struct Record {
    file: File,
    metadata: ObjectMetadata,
    body_offset: u64,
    body_len: u64,
}

/// Reserved field of `upload.json` holding the object key.
const UPLOAD_KEY_FIELD: &str = "objcrypt-upload-key";

fn checked_key(key: &str) -> CryptoResult<PathBuf> {
    let path = PathBuf::from(key);
    let valid = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(CryptoError::NotFound(format!("invalid object key {key:?}")));
    }
    Ok(path)
}

fn encode_metadata(metadata: &ObjectMetadata) -> CryptoResult<Vec<u8>> {
    serde_json::to_vec_pretty(metadata)
        .map_err(|e| CryptoError::Transport(format!("metadata encode: {e}")))
}

fn decode_metadata(bytes: &[u8]) -> CryptoResult<ObjectMetadata> {
    serde_json::from_slice(bytes)
        .map_err(|e| CryptoError::Transport(format!("metadata decode: {e}")))
}

fn temp_beside(path: &Path) -> CryptoResult<NamedTempFile> {
    let parent = path.parent().ok_or_else(|| {
        CryptoError::Transport(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;
    Ok(NamedTempFile::new_in(parent)?)
}

/// Copy exactly `content_length` bytes of `body` into `out`.
fn spool(body: &mut dyn UploadBody, out: &mut File, content_length: u64) -> CryptoResult<()> {
    let written = io::copy(body, out).map_err(CryptoError::from_io)?;
    check_length(written, content_length)
}

/// Flush a finished temp file and move it over `path`.
fn publish(tmp: NamedTempFile, path: &Path) -> CryptoResult<()> {
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CryptoError::Io(e.error))?;
    Ok(())
}

fn write_small(path: &Path, data: &[u8]) -> CryptoResult<()> {
    let mut tmp = temp_beside(path)?;
    tmp.as_file_mut().write_all(data)?;
    publish(tmp, path)
}

fn not_found(key: &str, err: io::Error) -> CryptoError {
    if err.kind() == io::ErrorKind::NotFound {
        CryptoError::NotFound(key.to_string())
    } else {
        CryptoError::Io(err)
    }
}

impl ObjectTransport for LocalFsTransport {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(
        &self,
        key: &str,
        body: &mut dyn UploadBody,
        content_length: u64,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<()> {
        let (path, mut record) = self.begin_record(key, metadata)?;
        spool(body, record.as_file_mut(), content_length)?;
        publish(record, &path)?;
        tracing::debug!(key, bytes = content_length, "object written");
        Ok(())
    }

    fn get_object(&self, key: &str, range: Option<Range<u64>>) -> CryptoResult<GetObjectOutput> {
        let Record {
            mut file,
            metadata,
            body_offset,
            body_len,
        } = self.open_record(key)?;

        let span = match &range {
            Some(r) => clamp_range(r, body_len),
            None => 0..body_len,
        };
        file.seek(SeekFrom::Start(body_offset + span.start))?;
        let content_length = span.end - span.start;
        Ok(GetObjectOutput {
            body: Box::new(file.take(content_length)),
            metadata,
            content_length,
            object_size: body_len,
        })
    }

    fn head_object(&self, key: &str) -> CryptoResult<HeadObjectOutput> {
        let record = self.open_record(key)?;
        Ok(HeadObjectOutput {
            metadata: record.metadata,
            object_size: record.body_len,
        })
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<String> {
        checked_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join("uploads").join(&upload_id);
        fs::create_dir_all(&dir)?;

        let mut record = metadata.clone();
        record.insert(UPLOAD_KEY_FIELD.into(), key.to_string());
        write_small(&dir.join("upload.json"), &encode_metadata(&record)?)?;
        tracing::debug!(key, upload_id = %upload_id, "multipart upload created");
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn UploadBody,
        content_length: u64,
    ) -> CryptoResult<()> {
        let dir = self.upload_dir(upload_id)?;
        let (upload_key, _) = self.read_upload(&dir)?;
        if upload_key != key {
            return Err(CryptoError::NotFound(format!("upload {upload_id} for {key}")));
        }
        let path = dir.join(format!("{part_number:05}.part"));
        let mut tmp = temp_beside(&path)?;
        spool(body, tmp.as_file_mut(), content_length)?;
        publish(tmp, &path)
    }

    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        let dir = self.upload_dir(upload_id)?;
        let (upload_key, metadata) = self.read_upload(&dir)?;
        if upload_key != key {
            return Err(CryptoError::NotFound(format!("upload {upload_id} for {key}")));
        }

        let mut parts: Vec<(u32, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let number = path
                    .file_name()?
                    .to_str()?
                    .strip_suffix(".part")?
                    .parse()
                    .ok()?;
                Some((number, path))
            })
            .collect();
        parts.sort_by_key(|(n, _)| *n);

        let (path, mut record) = self.begin_record(key, &metadata)?;
        let (mut expected, mut written) = (0u64, 0u64);
        for (_, part) in &parts {
            let mut file = File::open(part)?;
            expected += file.metadata()?.len();
            written += io::copy(&mut file, record.as_file_mut())?;
        }
        check_length(written, expected)?;

        publish(record, &path)?;
        fs::remove_dir_all(&dir)?;
        tracing::debug!(
            key,
            upload_id,
            parts = parts.len(),
            bytes = written,
            "multipart upload completed"
        );
        Ok(())
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        if let Ok(dir) = self.upload_dir(upload_id) {
            fs::remove_dir_all(&dir)?;
        }
        tracing::debug!(key, upload_id, "multipart upload aborted");
        Ok(())
    }
}
