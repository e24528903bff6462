//! The storage collaborator: put/get/head and multipart calls
//!
//! The encrypting client only ever hands a transport ciphertext plus string
//! metadata, and only ever reads ciphertext plus metadata back. Retries of a
//! partially sent body are the transport's business; it rewinds the body
//! with [`UploadBody::mark`] / [`UploadBody::reset`] instead of buffering it.

use std::io::{self, Cursor, Read, Seek};
use std::ops::Range;

use objcrypt_core::{CryptoResult, ObjectMetadata};
use objcrypt_crypto::CipherReader;

/// A request body that can be rewound for a resend.
pub trait UploadBody: Read + Send {
    fn mark(&mut self) -> io::Result<u64>;
    fn reset(&mut self) -> io::Result<()>;
}

impl<R: Read + Seek + Send> UploadBody for CipherReader<R> {
    fn mark(&mut self) -> io::Result<u64> {
        CipherReader::mark(self)
    }

    fn reset(&mut self) -> io::Result<()> {
        CipherReader::reset(self)
    }
}

/// An in-memory body, used for instruction objects.
pub struct BytesBody {
    cursor: Cursor<Vec<u8>>,
    mark: u64,
}

impl BytesBody {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
            mark: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }
}

impl Read for BytesBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl UploadBody for BytesBody {
    fn mark(&mut self) -> io::Result<u64> {
        self.mark = self.cursor.position();
        Ok(self.mark)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.cursor.set_position(self.mark);
        Ok(())
    }
}

pub struct GetObjectOutput {
    pub body: Box<dyn Read + Send>,
    pub metadata: ObjectMetadata,
    /// Bytes in `body` (the range length for ranged gets)
    pub content_length: u64,
    /// Stored size of the whole object
    pub object_size: u64,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("metadata", &self.metadata)
            .field("content_length", &self.content_length)
            .field("object_size", &self.object_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct HeadObjectOutput {
    pub metadata: ObjectMetadata,
    pub object_size: u64,
}

pub trait ObjectTransport: Send + Sync {
    /// Bucket (or store) name, used in logs and multipart contexts.
    fn bucket(&self) -> &str;

    /// Store `content_length` bytes of `body` under `key`.
    fn put_object(
        &self,
        key: &str,
        body: &mut dyn UploadBody,
        content_length: u64,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<()>;

    /// Fetch an object, or the half-open byte `range` of it. Ranges past the
    /// end are clamped. Missing objects are `CryptoError::NotFound`.
    fn get_object(&self, key: &str, range: Option<Range<u64>>) -> CryptoResult<GetObjectOutput>;

    fn head_object(&self, key: &str) -> CryptoResult<HeadObjectOutput>;

    /// Start a multipart upload; returns the upload id.
    fn create_multipart_upload(&self, key: &str, metadata: &ObjectMetadata) -> CryptoResult<String>;

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn UploadBody,
        content_length: u64,
    ) -> CryptoResult<()>;

    /// Assemble the uploaded parts, in part-number order, into the object.
    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()>;

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()>;
}

impl<T: ObjectTransport + ?Sized> ObjectTransport for std::sync::Arc<T> {
    fn bucket(&self) -> &str {
        (**self).bucket()
    }

    fn put_object(
        &self,
        key: &str,
        body: &mut dyn UploadBody,
        content_length: u64,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<()> {
        (**self).put_object(key, body, content_length, metadata)
    }

    fn get_object(&self, key: &str, range: Option<Range<u64>>) -> CryptoResult<GetObjectOutput> {
        (**self).get_object(key, range)
    }

    fn head_object(&self, key: &str) -> CryptoResult<HeadObjectOutput> {
        (**self).head_object(key)
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<String> {
        (**self).create_multipart_upload(key, metadata)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn UploadBody,
        content_length: u64,
    ) -> CryptoResult<()> {
        (**self).upload_part(key, upload_id, part_number, body, content_length)
    }

    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        (**self).complete_multipart_upload(key, upload_id)
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        (**self).abort_multipart_upload(key, upload_id)
    }
}

/// Read exactly `content_length` bytes of a body, as a transport would
/// stream it onto the wire.
pub(crate) fn drain_body(body: &mut dyn UploadBody, content_length: u64) -> CryptoResult<Vec<u8>> {
    let mut data = Vec::with_capacity(usize::try_from(content_length).unwrap_or(0));
    body.read_to_end(&mut data)
        .map_err(objcrypt_core::CryptoError::from_io)?;
    check_length(data.len() as u64, content_length)?;
    Ok(data)
}

pub(crate) fn check_length(actual: u64, declared: u64) -> CryptoResult<()> {
    if actual != declared {
        return Err(objcrypt_core::CryptoError::Transport(format!(
            "body length {actual} does not match declared content length {declared}"
        )));
    }
    Ok(())
}

pub(crate) fn clamp_range(range: &Range<u64>, size: u64) -> Range<u64> {
    let end = range.end.min(size);
    range.start.min(end)..end
}
