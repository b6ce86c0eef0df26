//! Object-storage layout of build artifacts
//!
//! `{root}/index_files/{build_id}/{index_version}/{partition_id}/{segment_id}/{file_key}`

use crate::error::{CoordError, Result};
use crate::types::{BuildId, PartitionId, SegmentId};

/// Directory under the storage root that holds every build's artifacts
pub const SEGMENT_INDEX_PATH: &str = "index_files";

fn join(root: &str, rest: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", root, rest)
    }
}

/// Prefix enumerated by the file garbage collector, with trailing slash
pub fn index_files_root(root: &str) -> String {
    format!("{}/", join(root, SEGMENT_INDEX_PATH))
}

/// Prefix owning every file of one build, with trailing slash
pub fn build_prefix(root: &str, build_id: BuildId) -> String {
    format!("{}{}/", index_files_root(root), build_id)
}

/// Full key of one produced index file
pub fn segment_index_file_path(
    root: &str,
    build_id: BuildId,
    index_version: i64,
    partition_id: PartitionId,
    segment_id: SegmentId,
    file_key: &str,
) -> String {
    format!(
        "{}{}/{}/{}/{}",
        build_prefix(root, build_id),
        index_version,
        partition_id,
        segment_id,
        file_key
    )
}

/// Extract the build id from any key under [`index_files_root`]
///
/// Accepts both a build directory (`.../index_files/10/`) and a file key.
pub fn parse_build_id_from_path(key: &str) -> Result<BuildId> {
    let marker = format!("{}/", SEGMENT_INDEX_PATH);
    let start = key
        .find(&marker)
        .map(|pos| pos + marker.len())
        .ok_or_else(|| CoordError::invalid_input(format!("not an index file path: {}", key)))?;
    let rest = &key[start..];
    let id = rest.split('/').next().unwrap_or_default();
    id.parse::<BuildId>()
        .map_err(|e| CoordError::invalid_input(format!("invalid build id in {}: {}", key, e)))
}
