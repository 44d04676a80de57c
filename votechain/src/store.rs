use crate::*;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// A durable, ordered block store: one row per block, append-only except for wholesale
/// replacement when a longer chain is adopted.
pub trait BlockStore: Send + Sync {
    /// All stored blocks in chain order
    fn get_all(&self) -> Result<Vec<Block>, Error>;

    /// Append one block
    fn insert(&self, block: &Block) -> Result<(), Error>;

    /// Truncate the store and bulk-insert `blocks`
    fn replace_all(&self, blocks: &[Block]) -> Result<(), Error>;
}

/// A simple store that keeps blocks in memory
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Vec<Block>>,
}

impl MemStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<Vec<Block>>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl BlockStore for MemStore {
    fn get_all(&self) -> Result<Vec<Block>, Error> {
        Ok(self.lock()?.clone())
    }

    fn insert(&self, block: &Block) -> Result<(), Error> {
        self.lock()?.push(block.clone());
        Ok(())
    }

    fn replace_all(&self, blocks: &[Block]) -> Result<(), Error> {
        *self.lock()? = blocks.to_vec();
        Ok(())
    }
}

impl From<Vec<Block>> for MemStore {
    fn from(blocks: Vec<Block>) -> Self {
        MemStore {
            inner: Mutex::new(blocks),
        }
    }
}

/// Stores blocks as JSON lines in a single file
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonFileStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<()>, Error> {
        self.lock
            .lock()
            .map_err(|_| Error::Store("file store lock poisoned".to_string()))
    }
}

fn io_error(e: std::io::Error) -> Error {
    Error::Store(e.to_string())
}

impl BlockStore for JsonFileStore {
    fn get_all(&self) -> Result<Vec<Block>, Error> {
        let _guard = self.guard()?;
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error(e)),
        };

        let mut blocks = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_error)?;
            if line.trim().is_empty() {
                continue;
            }
            blocks.push(serde_json::from_str(&line)?);
        }
        Ok(blocks)
    }

    fn insert(&self, block: &Block) -> Result<(), Error> {
        let _guard = self.guard()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        let mut line = serde_json::to_string(block)?;
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(io_error)
    }

    fn replace_all(&self, blocks: &[Block]) -> Result<(), Error> {
        let _guard = self.guard()?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).map_err(io_error)?;
            for block in blocks {
                let mut line = serde_json::to_string(block)?;
                line.push('\n');
                file.write_all(line.as_bytes()).map_err(io_error)?;
            }
            file.sync_all().map_err(io_error)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_error)
    }
}
