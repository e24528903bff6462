//! In-memory transport
//!
//! Stores objects in a map behind a `parking_lot::Mutex`. It can simulate a
//! connection that drops partway through an upload: the body is rewound with
//! `mark`/`reset` and sent again, as a retrying HTTP client would.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::ops::Range;

use objcrypt_core::{CryptoError, CryptoResult, ObjectMetadata};
use parking_lot::Mutex;

use crate::transport::{
    clamp_range, drain_body, GetObjectOutput, HeadObjectOutput, ObjectTransport, UploadBody,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: ObjectMetadata,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    /// Drop the next body after this many bytes, then resend it
    fail_after: Option<u64>,
    resends: u32,
    ranges: Vec<(String, Option<Range<u64>>)>,
    aborted: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryTransport {
    bucket: String,
    state: Mutex<State>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryTransport {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make the next upload fail after `bytes` bytes and be resent.
    pub fn fail_next_upload_after(&self, bytes: u64) {
        self.state.lock().fail_after = Some(bytes);
    }

    /// Bodies rewound and sent again so far.
    pub fn resend_count(&self) -> u32 {
        self.state.lock().resends
    }

    /// Every `get_object` call as (key, requested range).
    pub fn requested_ranges(&self) -> Vec<(String, Option<Range<u64>>)> {
        self.state.lock().ranges.clone()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    pub fn object(&self, key: &str) -> Option<(Vec<u8>, ObjectMetadata)> {
        self.state
            .lock()
            .objects
            .get(key)
            .map(|o| (o.data.clone(), o.metadata.clone()))
    }

    /// Overwrite raw stored bytes and metadata (tests tamper with objects).
    pub fn insert_object(&self, key: &str, data: Vec<u8>, metadata: ObjectMetadata) {
        self.state
            .lock()
            .objects
            .insert(key.to_string(), StoredObject { data, metadata });
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Read a body, honoring a pending simulated connection drop.
    fn receive(&self, body: &mut dyn UploadBody, content_length: u64) -> CryptoResult<Vec<u8>> {
        let fail_after = self.state.lock().fail_after.take();
        let Some(limit) = fail_after else {
            return drain_body(body, content_length);
        };

        body.mark().map_err(CryptoError::from_io)?;
        let mut partial = Vec::new();
        (&mut *body)
            .take(limit)
            .read_to_end(&mut partial)
            .map_err(CryptoError::from_io)?;
        tracing::debug!(sent = partial.len(), "simulated connection drop, resending body");

        body.reset().map_err(CryptoError::from_io)?;
        self.state.lock().resends += 1;
        let data = drain_body(body, content_length)?;
        if !data.starts_with(&partial) {
            return Err(CryptoError::Transport(
                "resent body differs from the first attempt".into(),
            ));
        }
        Ok(data)
    }
}

impl ObjectTransport for MemoryTransport {
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
        let data = self.receive(body, content_length)?;
        self.state.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn get_object(&self, key: &str, range: Option<Range<u64>>) -> CryptoResult<GetObjectOutput> {
        let mut state = self.state.lock();
        state.ranges.push((key.to_string(), range.clone()));
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| CryptoError::NotFound(key.to_string()))?;

        let size = object.data.len() as u64;
        let span = match &range {
            Some(r) => clamp_range(r, size),
            None => 0..size,
        };
        let data = object.data[span.start as usize..span.end as usize].to_vec();
        Ok(GetObjectOutput {
            content_length: data.len() as u64,
            body: Box::new(Cursor::new(data)),
            metadata: object.metadata.clone(),
            object_size: size,
        })
    }

    fn head_object(&self, key: &str) -> CryptoResult<HeadObjectOutput> {
        let state = self.state.lock();
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| CryptoError::NotFound(key.to_string()))?;
        Ok(HeadObjectOutput {
            metadata: object.metadata.clone(),
            object_size: object.data.len() as u64,
        })
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<String> {
        let mut state = self.state.lock();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
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
        let data = self.receive(body, content_length)?;
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| CryptoError::NotFound(format!("upload {upload_id} for {key}")))?;
        upload.parts.insert(part_number, data);
        Ok(())
    }

    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        let mut state = self.state.lock();
        let upload = match state.uploads.remove(upload_id) {
            Some(u) if u.key == key => u,
            _ => return Err(CryptoError::NotFound(format!("upload {upload_id} for {key}"))),
        };
        let data: Vec<u8> = upload.parts.into_values().flatten().collect();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: upload.metadata,
            },
        );
        Ok(())
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> CryptoResult<()> {
        let mut state = self.state.lock();
        state.uploads.remove(upload_id);
        state.aborted.push(format!("{key}:{upload_id}"));
        Ok(())
    }
}
