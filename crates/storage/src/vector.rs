//! Vector index storage: flat per-index vector rows scored at query time
//! against the index's configured metric. No approximate-nearest-neighbor
//! structure — every query is a full scan, which is the right tradeoff at
//! the scale a single local process is expected to hold.

use localflare_common::{LocalflareError, Result};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::MetaDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    Euclidean,
    DotProduct,
}

impl Metric {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::DotProduct => "dot-product",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "euclidean" => Self::Euclidean,
            "dot-product" => Self::DotProduct,
            _ => Self::Cosine,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub dimensions: usize,
    pub metric: Metric,
}

#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: String,
    pub namespace: Option<String>,
    pub values: Vec<f32>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Match {
    pub id: String,
    pub score: f32,
    pub values: Option<Vec<f32>>,
    pub metadata: Option<String>,
}

pub struct QueryOptions<'a> {
    pub top_k: usize,
    pub namespace: Option<&'a str>,
    pub return_values: bool,
    pub return_metadata: bool,
    /// Metadata equality filter: a vector is kept only if its metadata
    /// object has every field in this object set to the same value.
    pub filter: Option<&'a str>,
}

pub struct VectorStore {
    db: MetaDb,
}

impl VectorStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    /// Index names are not namespaced like other resources — `name` itself
    /// is the key, matching the binding surface workers address indexes by.
    pub fn create_index(&self, name: &str, dimensions: usize, metric: Metric) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vector_indexes (name, dimensions, metric) VALUES (?1, ?2, ?3)",
                params![name, dimensions as i64, metric.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn index(&self, name: &str) -> Result<IndexInfo> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT name, dimensions, metric FROM vector_indexes WHERE name = ?1",
                params![name],
                |row| {
                    Ok(IndexInfo {
                        name: row.get(0)?,
                        dimensions: row.get::<_, i64>(1)? as usize,
                        metric: Metric::from_str(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| LocalflareError::NotFound(format!("vector index {name}")))
        })
    }

    /// Inserts, rejecting an id that already exists. Use [`Self::upsert`] to
    /// overwrite.
    pub fn insert(&self, index: &str, entries: &[VectorEntry]) -> Result<Vec<String>> {
        let info = self.index(index)?;
        self.db.with_conn(|conn| {
            let mut ids = Vec::with_capacity(entries.len());
            for entry in entries {
                if entry.values.len() != info.dimensions {
                    return Err(LocalflareError::InvalidArgument(format!(
                        "vector has {} dimensions, index {} expects {}",
                        entry.values.len(),
                        index,
                        info.dimensions
                    )));
                }
                let id = if entry.id.is_empty() { Uuid::new_v4().to_string() } else { entry.id.clone() };
                conn.execute(
                    "INSERT INTO vectors (id, index_name, namespace, values_raw, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, index, entry.namespace, values_to_bytes(&entry.values), entry.metadata],
                )?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    pub fn upsert(&self, index: &str, entries: &[VectorEntry]) -> Result<Vec<String>> {
        let info = self.index(index)?;
        self.db.with_conn(|conn| {
            let mut ids = Vec::with_capacity(entries.len());
            for entry in entries {
                if entry.values.len() != info.dimensions {
                    return Err(LocalflareError::InvalidArgument(format!(
                        "vector has {} dimensions, index {} expects {}",
                        entry.values.len(),
                        index,
                        info.dimensions
                    )));
                }
                let id = if entry.id.is_empty() { Uuid::new_v4().to_string() } else { entry.id.clone() };
                conn.execute(
                    "INSERT INTO vectors (id, index_name, namespace, values_raw, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (id) DO UPDATE SET
                         namespace = excluded.namespace,
                         values_raw = excluded.values_raw,
                         metadata = excluded.metadata",
                    params![id, index, entry.namespace, values_to_bytes(&entry.values), entry.metadata],
                )?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    pub fn get_by_ids(&self, index: &str, ids: &[String]) -> Result<Vec<VectorEntry>> {
        self.db.with_conn(|conn| {
            let mut out = Vec::new();
            for id in ids {
                let row = conn
                    .query_row(
                        "SELECT id, namespace, values_raw, metadata FROM vectors
                         WHERE index_name = ?1 AND id = ?2",
                        params![index, id],
                        |row| {
                            Ok(VectorEntry {
                                id: row.get(0)?,
                                namespace: row.get(1)?,
                                values: bytes_to_values(&row.get::<_, Vec<u8>>(2)?),
                                metadata: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;
                if let Some(row) = row {
                    out.push(row);
                }
            }
            Ok(out)
        })
    }

    pub fn delete_by_ids(&self, index: &str, ids: &[String]) -> Result<u64> {
        self.db.with_conn(|conn| {
            let mut deleted = 0u64;
            for id in ids {
                deleted += conn.execute(
                    "DELETE FROM vectors WHERE index_name = ?1 AND id = ?2",
                    params![index, id],
                )? as u64;
            }
            Ok(deleted)
        })
    }

    /// Full scan over every vector in `index` (optionally restricted to one
    /// namespace), scored by the index's metric and returned best-first.
    pub fn query(&self, index: &str, vector: &[f32], options: &QueryOptions<'_>) -> Result<Vec<Match>> {
        let info = self.index(index)?;
        if vector.len() != info.dimensions {
            return Err(LocalflareError::InvalidArgument(format!(
                "query vector has {} dimensions, index {} expects {}",
                vector.len(),
                index,
                info.dimensions
            )));
        }
        let filter: Option<serde_json::Map<String, serde_json::Value>> = options
            .filter
            .map(|f| {
                serde_json::from_str::<serde_json::Value>(f)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .ok_or_else(|| LocalflareError::InvalidArgument("vector query filter must be a JSON object".to_string()))
            })
            .transpose()?;

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, namespace, values_raw, metadata FROM vectors WHERE index_name = ?1",
            )?;
            let rows: Vec<(String, Option<String>, Vec<u8>, Option<String>)> = stmt
                .query_map(params![index], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut scored: Vec<Match> = rows
                .into_iter()
                .filter(|(_, namespace, _, _)| {
                    options.namespace.is_none_or(|ns| namespace.as_deref() == Some(ns))
                })
                .filter(|(_, _, _, metadata)| matches_filter(metadata.as_deref(), filter.as_ref()))
                .map(|(id, _namespace, raw, metadata)| {
                    let values = bytes_to_values(&raw);
                    let score = score(info.metric, vector, &values);
                    Match {
                        id,
                        score,
                        values: options.return_values.then_some(values),
                        metadata: options.return_metadata.then_some(metadata).flatten(),
                    }
                })
                .collect();

            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(options.top_k);
            Ok(scored)
        })
    }
}

/// A vector passes when every key in `filter` is present in its metadata
/// with an equal JSON value. No filter (or no metadata on the vector while a
/// filter is set) is handled as "no filter" / "fails the filter" respectively.
fn matches_filter(metadata: Option<&str>, filter: Option<&serde_json::Map<String, serde_json::Value>>) -> bool {
    let Some(filter) = filter else { return true };
    let Some(metadata) = metadata else { return false };
    let Ok(serde_json::Value::Object(metadata)) = serde_json::from_str(metadata) else {
        return false;
    };
    filter.iter().all(|(key, value)| metadata.get(key) == Some(value))
}

fn values_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Higher is always better, regardless of metric: cosine and dot-product
/// are similarity already, euclidean distance is inverted to `1 / (1 + d)`.
fn score(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::DotProduct => dot(a, b),
        Metric::Cosine => {
            let denom = norm(a) * norm(b);
            if denom == 0.0 {
                0.0
            } else {
                dot(a, b) / denom
            }
        }
        Metric::Euclidean => {
            let distance: f32 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt();
            1.0 / (1.0 + distance)
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: Vec<f32>) -> VectorEntry {
        VectorEntry { id: id.to_string(), namespace: None, values, metadata: None }
    }

    #[test]
    fn query_ranks_the_closest_cosine_match_first() {
        let store = VectorStore::new(MetaDb::open_in_memory().unwrap());
        store.create_index("idx", 2, Metric::Cosine).unwrap();
        store
            .insert("idx", &[entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .unwrap();
        let matches = store
            .query(
                "idx",
                &[1.0, 0.1],
                &QueryOptions {
                    top_k: 1,
                    namespace: None,
                    return_values: false,
                    return_metadata: false,
                    filter: None,
                },
            )
            .unwrap();
        assert_eq!(matches[0].id, "a");
    }

    #[test]
    fn upsert_overwrites_values_for_an_existing_id() {
        let store = VectorStore::new(MetaDb::open_in_memory().unwrap());
        store.create_index("idx", 1, Metric::DotProduct).unwrap();
        store.upsert("idx", &[entry("a", vec![1.0])]).unwrap();
        store.upsert("idx", &[entry("a", vec![9.0])]).unwrap();
        let got = store.get_by_ids("idx", &["a".to_string()]).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].values, vec![9.0]);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let store = VectorStore::new(MetaDb::open_in_memory().unwrap());
        store.create_index("idx", 3, Metric::Cosine).unwrap();
        let err = store.insert("idx", &[entry("a", vec![1.0, 2.0])]).unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
    }

    #[test]
    fn query_filter_excludes_vectors_with_non_matching_metadata() {
        let store = VectorStore::new(MetaDb::open_in_memory().unwrap());
        store.create_index("idx", 1, Metric::DotProduct).unwrap();
        store
            .insert(
                "idx",
                &[
                    VectorEntry {
                        id: "a".to_string(),
                        namespace: None,
                        values: vec![1.0],
                        metadata: Some(r#"{"genre":"drama"}"#.to_string()),
                    },
                    VectorEntry {
                        id: "b".to_string(),
                        namespace: None,
                        values: vec![1.0],
                        metadata: Some(r#"{"genre":"comedy"}"#.to_string()),
                    },
                ],
            )
            .unwrap();
        let matches = store
            .query(
                "idx",
                &[1.0],
                &QueryOptions {
                    top_k: 10,
                    namespace: None,
                    return_values: false,
                    return_metadata: false,
                    filter: Some(r#"{"genre":"comedy"}"#),
                },
            )
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "b");
    }

    #[test]
    fn delete_by_ids_removes_only_named_vectors() {
        let store = VectorStore::new(MetaDb::open_in_memory().unwrap());
        store.create_index("idx", 1, Metric::Cosine).unwrap();
        store.insert("idx", &[entry("a", vec![1.0]), entry("b", vec![2.0])]).unwrap();
        let deleted = store.delete_by_ids("idx", &["a".to_string()]).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_by_ids("idx", &["a".to_string()]).unwrap().is_empty());
        assert_eq!(store.get_by_ids("idx", &["b".to_string()]).unwrap().len(), 1);
    }
}
