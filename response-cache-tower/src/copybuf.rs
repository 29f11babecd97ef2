use std::{
    future::poll_fn,
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use bytes::{Buf, Bytes};
use http_body::Body as HttpBody;

/// Matches the copy buffer size used by `net/http` style servers.
pub(crate) const COPY_BUF_SIZE: usize = 32 * 1024;

static POOL: Mutex<Vec<Box<[u8]>>> = Mutex::new(Vec::new());

/// A pooled 32 KiB scratch buffer, returned to the process-wide pool on
/// drop. Returning a buffer of the wrong size is a programmer error and
/// panics.
pub(crate) struct CopyBuf(Option<Box<[u8]>>);

impl CopyBuf {
    pub(crate) fn acquire() -> Self {
        let buf = POOL
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUF_SIZE].into_boxed_slice());
        CopyBuf(Some(buf))
    }
}

impl Deref for CopyBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for CopyBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for CopyBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.0.take() {
            put(buf);
        }
    }
}

fn put(buf: Box<[u8]>) {
    if buf.len() != COPY_BUF_SIZE {
        panic!("trying to return a copy buffer of the wrong size to the pool");
    }
    POOL.lock().unwrap().push(buf);
}

/// Drains a body into memory through a pooled scratch buffer, so the
/// per-copy working set stays bounded no matter how large the frames are.
pub(crate) async fn copy_body<B>(body: B) -> Result<Bytes, B::Error>
where
    B: HttpBody,
{
    let mut body = Box::pin(body);
    let mut out = Vec::new();
    let mut buf = CopyBuf::acquire();
    while let Some(frame) = poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
        let frame = frame?;
        if let Ok(mut data) = frame.into_data() {
            while data.has_remaining() {
                let chunk = data.chunk();
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                out.extend_from_slice(&buf[..n]);
                data.advance(n);
            }
        }
    }
    Ok(out.into())
}
