//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

use super::traits::CachedEntry;
use crate::db::{parse_datetime, Database};
use crate::http::{Request, Response};

/// Trait for cache storage backends.
///
/// Each call is atomic on its own; concurrent writers to the same key
/// resolve as last writer wins.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing partition, in creation order.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the same request.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a batch of responses atomically: either all land or none do.
  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look a request up in one partition.
  fn get(&self, partition: &str, request: &Request) -> Result<Option<CachedEntry>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Create an empty partition.
  #[cfg(test)]
  pub fn open(&self, partition: &str) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    ensure_partition(&tx, partition)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }
}

fn ensure_partition(tx: &Transaction<'_>, partition: &str) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
    params![partition],
  )
  .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;
  Ok(())
}

fn insert_entry(
  tx: &Transaction<'_>,
  partition: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  tx.execute(
    "INSERT OR REPLACE INTO cache_entries
       (partition, request_key, method, url, status, status_text, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      partition,
      request.cache_key(),
      request.method.as_str(),
      request.url.as_str(),
      response.status,
      response.status_text,
      headers,
      response.body,
    ],
  )
  .map_err(|e| eyre!("Failed to store entry for {}: {}", request.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    ensure_partition(&tx, partition)?;
    insert_entry(&tx, partition, request, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    ensure_partition(&tx, partition)?;
    for (request, response) in entries {
      insert_entry(&tx, partition, request, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn get(&self, partition: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(String, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, status_text, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, request.cache_key()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    let Some((url, status, status_text, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

    Ok(Some(CachedEntry {
      url,
      response: Response {
        status,
        status_text,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::testing::url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::in_memory().unwrap()))
  }

  #[test]
  fn test_put_then_get() {
    let storage = storage();
    let request = Request::get(url("/api/quizzes"));
    let mut response = Response::new(200, b"[1,2,3]".to_vec());
    response.headers.push(("content-type".into(), "application/json".into()));

    storage.put("dynamic-v1", &request, &response).unwrap();

    let entry = storage.get("dynamic-v1", &request).unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert_eq!(entry.url, "http://localhost:5000/api/quizzes");
    assert!(storage.get("static-v1", &request).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = storage();
    let request = Request::get(url("/api/quizzes"));

    storage.put("dynamic-v1", &request, &Response::new(200, "old")).unwrap();
    storage.put("dynamic-v1", &request, &Response::new(200, "new")).unwrap();

    let entry = storage.get("dynamic-v1", &request).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let storage = storage();
    let request = Request::get(url("/index.html"));
    storage.put("static-v1", &request, &Response::new(200, "<html>")).unwrap();
    storage.open("static-v2").unwrap();

    assert!(storage.delete_partition("static-v1").unwrap());
    assert!(!storage.delete_partition("static-v1").unwrap());
    assert!(storage.get("static-v1", &request).unwrap().is_none());
    assert_eq!(storage.partitions().unwrap(), vec!["static-v2".to_string()]);
  }

  #[test]
  fn test_partitions_in_creation_order() {
    let storage = storage();
    for name in ["static-v1", "dynamic-v1", "static-v2"] {
      storage.open(name).unwrap();
    }
    storage.open("static-v1").unwrap();

    assert_eq!(
      storage.partitions().unwrap(),
      vec!["static-v1", "dynamic-v1", "static-v2"]
    );
  }
}
