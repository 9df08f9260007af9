//! File-backed durable queues
//!
//! Each queue is one JSON file under the queue directory holding an ordered
//! sequence of records. The whole file is rewritten on every mutation; queues
//! stay short (operator-scale messaging), so the rewrite is the durability
//! primitive. Writes go to a temp file which is renamed over the queue file,
//! and mutations on one queue are serialized by an internal lock.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// A persistent ordered sequence of JSON-serializable records.
pub struct DurableQueue<T> {
    path: PathBuf,
    items: Mutex<Vec<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> DurableQueue<T> {
    /// Open a queue file, loading any existing contents.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = if path.exists() {
            let raw = fs::read(&path)?;
            if raw.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&raw).map_err(|e| {
                    Error::Queue(format!("corrupt queue file {}: {e}", path.display()))
                })?
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Append an item; returns once the file is persisted.
    pub fn push(&self, item: T) -> Result<()> {
        let mut items = self.lock();
        items.push(item);
        self.persist(&items)
    }

    /// Remove and return the head item, if any.
    pub fn poll(&self) -> Result<Option<T>> {
        let mut items = self.lock();
        if items.is_empty() {
            return Ok(None);
        }
        let head = items.remove(0);
        self.persist(&items)?;
        Ok(Some(head))
    }

    /// Remove and return every item matching the predicate.
    pub fn delete_where(&self, pred: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        let mut items = self.lock();
        let mut removed = Vec::new();
        items.retain(|item| {
            if pred(item) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.persist(&items)?;
        }
        Ok(removed)
    }

    /// Return every item matching the predicate without removing it.
    pub fn find_where(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.lock().iter().filter(|item| pred(item)).cloned().collect()
    }

    /// Current contents, in order, without removing them.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, items: &[T]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(items)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        topic: String,
        seq: u32,
    }

    fn item(topic: &str, seq: u32) -> Item {
        Item {
            topic: topic.to_string(),
            seq,
        }
    }

    #[test]
    fn test_push_poll_fifo() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path().join("q.json")).unwrap();

        queue.push(item("a", 1)).unwrap();
        queue.push(item("a", 2)).unwrap();
        queue.push(item("b", 3)).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.poll().unwrap(), Some(item("a", 1)));
        assert_eq!(queue.poll().unwrap(), Some(item("a", 2)));
        assert_eq!(queue.poll().unwrap(), Some(item("b", 3)));
        assert_eq!(queue.poll().unwrap(), None);
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");

        {
            let queue = DurableQueue::open(&path).unwrap();
            queue.push(item("a", 1)).unwrap();
            queue.push(item("b", 2)).unwrap();
        }

        let queue = DurableQueue::<Item>::open(&path).unwrap();
        assert_eq!(queue.snapshot(), vec![item("a", 1), item("b", 2)]);
        assert_eq!(queue.poll().unwrap(), Some(item("a", 1)));
    }

    #[test]
    fn test_delete_where_removes_and_returns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = DurableQueue::open(&path).unwrap();

        queue.push(item("a", 1)).unwrap();
        queue.push(item("b", 2)).unwrap();
        queue.push(item("a", 3)).unwrap();

        let removed = queue.delete_where(|i| i.topic == "a").unwrap();
        assert_eq!(removed, vec![item("a", 1), item("a", 3)]);
        assert_eq!(queue.snapshot(), vec![item("b", 2)]);

        // the deletion is durable
        let reopened = DurableQueue::<Item>::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), vec![item("b", 2)]);
    }

    #[test]
    fn test_find_where_keeps_items() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path().join("q.json")).unwrap();

        queue.push(item("a", 1)).unwrap();
        queue.push(item("b", 2)).unwrap();

        let found = queue.find_where(|i| i.topic == "b");
        assert_eq!(found, vec![item("b", 2)]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = DurableQueue::open(&path).unwrap();
        queue.push(item("a", 1)).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("q.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(DurableQueue::<Item>::open(&path).is_err());
    }
}
