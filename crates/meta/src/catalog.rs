//! Persisted layout of Index and SegmentIndex rows
//!
//! ```text
//! field-index/{collection_id}/{index_id}                -> Index
//! segment-index/{collection_id}/{index_id}/{build_id}   -> SegmentIndex
//! ```
//!
//! Values are MessagePack with named fields. Every multi-row write goes
//! through one `multi_save_and_remove` call so it lands atomically.

use idxcoord_core::{BuildId, CollectionId, CoordError, Index, IndexId, Result, SegmentIndex};
use idxcoord_storage::MetaKv;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Prefix of Index rows
pub const INDEX_PREFIX: &str = "field-index";
/// Prefix of SegmentIndex rows
pub const SEGMENT_INDEX_PREFIX: &str = "segment-index";

/// Key of an Index row
pub fn index_key(collection_id: CollectionId, index_id: IndexId) -> String {
    format!("{}/{}/{}", INDEX_PREFIX, collection_id, index_id)
}

/// Key of a SegmentIndex row
pub fn segment_index_key(
    collection_id: CollectionId,
    index_id: IndexId,
    build_id: BuildId,
) -> String {
    format!(
        "{}/{}/{}/{}",
        SEGMENT_INDEX_PREFIX, collection_id, index_id, build_id
    )
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| CoordError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| CoordError::Serialization(format!("{}: {}", key, e)))
}

fn seg_entry(row: &SegmentIndex) -> Result<(String, Vec<u8>)> {
    Ok((
        segment_index_key(row.collection_id, row.index_id, row.build_id),
        encode(row)?,
    ))
}

/// Typed access to the KV store for metadata rows
#[derive(Clone)]
pub struct Catalog {
    kv: Arc<dyn MetaKv>,
}

impl Catalog {
    /// Wrap a KV store
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self { kv }
    }

    /// Underlying KV store
    pub fn kv(&self) -> &Arc<dyn MetaKv> {
        &self.kv
    }

    /// Persist a new or changed Index row
    pub fn save_index(&self, index: &Index) -> Result<()> {
        self.kv
            .save(&index_key(index.collection_id, index.index_id), encode(index)?)
    }

    /// Persist several Index rows atomically
    pub fn save_indexes(&self, indexes: &[Index]) -> Result<()> {
        let kvs = indexes
            .iter()
            .map(|i| Ok((index_key(i.collection_id, i.index_id), encode(i)?)))
            .collect::<Result<Vec<_>>>()?;
        self.kv.multi_save(kvs)
    }

    /// Every persisted Index row
    pub fn list_indexes(&self) -> Result<Vec<Index>> {
        self.kv
            .load_with_prefix(&format!("{}/", INDEX_PREFIX))?
            .into_iter()
            .map(|(k, v)| decode(&k, &v))
            .collect()
    }

    /// Physically remove an Index row
    pub fn drop_index(&self, collection_id: CollectionId, index_id: IndexId) -> Result<()> {
        self.kv.remove(&index_key(collection_id, index_id))
    }

    /// Persist several SegmentIndex rows atomically
    pub fn save_segment_indexes(&self, rows: &[SegmentIndex]) -> Result<()> {
        let kvs = rows.iter().map(seg_entry).collect::<Result<Vec<_>>>()?;
        self.kv.multi_save(kvs)
    }

    /// Persist one SegmentIndex row
    pub fn save_segment_index(&self, row: &SegmentIndex) -> Result<()> {
        self.save_segment_indexes(std::slice::from_ref(row))
    }

    /// Every persisted SegmentIndex row
    pub fn list_segment_indexes(&self) -> Result<Vec<SegmentIndex>> {
        self.kv
            .load_with_prefix(&format!("{}/", SEGMENT_INDEX_PREFIX))?
            .into_iter()
            .map(|(k, v)| decode(&k, &v))
            .collect()
    }

    /// Physically remove a SegmentIndex row
    pub fn drop_segment_index(&self, row: &SegmentIndex) -> Result<()> {
        self.kv
            .remove(&segment_index_key(row.collection_id, row.index_id, row.build_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idxcoord_core::{KeyValuePair, Liveness, Timestamp};
    use idxcoord_storage::KvStore;

    fn index(collection_id: CollectionId, index_id: IndexId) -> Index {
        Index {
            tenant_id: String::new(),
            collection_id,
            field_id: 10,
            index_id,
            index_name: format!("idx{}", index_id),
            type_params: vec![KeyValuePair::new("dim", "128")],
            index_params: vec![KeyValuePair::new("index_type", "IVF_FLAT")],
            user_index_params: Vec::new(),
            is_auto_index: false,
            liveness: Liveness::Active,
            create_time: Timestamp::from_millis(5),
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(index_key(1, 2), "field-index/1/2");
        assert_eq!(segment_index_key(1, 2, 3), "segment-index/1/2/3");
    }

    #[test]
    fn test_index_rows_persist() {
        let catalog = Catalog::new(Arc::new(KvStore::ephemeral()));
        catalog.save_indexes(&[index(1, 100), index(2, 200)]).unwrap();
        let mut loaded = catalog.list_indexes().unwrap();
        loaded.sort_by_key(|i| i.index_id);
        assert_eq!(loaded, vec![index(1, 100), index(2, 200)]);

        catalog.drop_index(1, 100).unwrap();
        assert_eq!(catalog.list_indexes().unwrap(), vec![index(2, 200)]);
    }

    #[test]
    fn test_segment_index_rows_persist() {
        let catalog = Catalog::new(Arc::new(KvStore::ephemeral()));
        let row = SegmentIndex::unissued(1, 2, 1000, 10250, 100, 10, 1);
        catalog.save_segment_index(&row).unwrap();
        assert_eq!(catalog.list_segment_indexes().unwrap(), vec![row.clone()]);
        catalog.drop_segment_index(&row).unwrap();
        assert!(catalog.list_segment_indexes().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        kv.save(&index_key(1, 1), b"not msgpack".to_vec()).unwrap();
        let err = Catalog::new(kv).list_indexes().unwrap_err();
        assert!(matches!(err, CoordError::Serialization(_)));
    }
}
