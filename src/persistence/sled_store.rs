use sled::{Db, Tree};

use super::{Storage, StorageError};

const MESSAGES_TREE: &str = "messages";

/// [`Storage`] backed by a sled tree.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(MESSAGES_TREE)?;
        Ok(Self { db, tree })
    }
}

impl Storage for SledStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn iterate(&self) -> Box<dyn Iterator<Item = Result<(String, Vec<u8>), StorageError>> + '_> {
        Box::new(self.tree.iter().map(|res| {
            let (key, value) = res?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::InvalidKey(e.into_bytes()))?;
            Ok((key, value.to_vec()))
        }))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("entries", &self.tree.len())
            .finish()
    }
}
