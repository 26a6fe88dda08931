//! Filesystem-backed external store
//!
//! Objects live under sharded directories (first two key characters) so a
//! busy store does not end up with one directory of millions of entries:
//!
//! ```text
//! store/
//!   ab/
//!     ab12cd...   # one object per key
//!   cd/
//!     cd78ef...
//! ```
//!
//! Writes go to a `.tmp` sibling and are renamed into place when the
//! writer is dropped, so readers never observe partial objects.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{Error, Result};

use super::{ExtKey, ExternalStore};

pub struct FsStore {
    root: PathBuf,
    codec: Arc<dyn Codec>,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>, codec: Arc<dyn Codec>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, codec })
    }

    fn object_path(&self, key: &ExtKey) -> PathBuf {
        let k = key.as_str();
        let shard = if k.len() >= 2 { &k[..2] } else { "xx" };
        self.root.join(shard).join(k)
    }
}

impl ExternalStore for FsStore {
    fn create(&self, key: &ExtKey) -> Result<Box<dyn Write + Send>> {
        let dst = self.object_path(key);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dst.with_extension("tmp");
        let file = File::create(&tmp)?;
        let writer = Box::new(PendingObject {
            file: Some(file),
            tmp,
            dst,
        });
        Ok(self.codec.wrap_compress(writer)?)
    }

    fn open(&self, key: &ExtKey) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.object_path(key))?;
        Ok(self.codec.wrap_decompress(Box::new(file))?)
    }

    fn delete(&self, keys: &[ExtKey]) -> Result<()> {
        let mut first_err = None;
        for key in keys {
            let path = self.object_path(key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("failed to delete external object {}: {}", key, e);
                    if first_err.is_none() {
                        first_err = Some(Error::Io(e));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Writer half of one object; renames the temp file into place on drop.
struct PendingObject {
    file: Option<File>,
    tmp: PathBuf,
    dst: PathBuf,
}

impl Write for PendingObject {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "object finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PendingObject {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let flushed = file.sync_all();
            drop(file);
            if let Err(e) = flushed.and_then(|_| fs::rename(&self.tmp, &self.dst)) {
                log::warn!(
                    "failed to finalize external object {}: {}",
                    self.dst.display(),
                    e
                );
                let _ = fs::remove_file(&self.tmp);
            }
        }
    }
}
