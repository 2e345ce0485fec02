use std::path::{Path, PathBuf};

/// What a mapping's cluster range is backed by.
///
/// `Undefined` exists only between directory enumeration and cluster
/// assignment; every mapping is a `File` or `Directory` once
/// ingestion finishes.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum MappingInfo {
    #[default]
    Undefined,
    File {
        /// Byte offset of the range's first cluster within the file.
        offset: u32,
    },
    Directory {
        parent_mapping_index: Option<usize>,
        /// Index of the directory's first entry in the directory table.
        first_dir_index: usize,
    },
}

/// Associates a cluster range `[begin, end)` with the host object
/// backing it and the short-name directory entry describing it.
///
/// The directory table and the mapping table both relocate while they
/// grow, so mappings refer to entries by index, never by pointer.
#[derive(Clone, Debug, Default)]
pub struct Mapping {
    pub begin: u32,
    pub end: u32,
    /// Index of the short-name entry in the directory table.
    pub dir_index: usize,
    pub info: MappingInfo,
    /// Host-side absolute path.
    pub path: PathBuf,
    #[allow(dead_code)]
    pub read_only: bool,
    /// Set tentatively at the start of a commit; cleared for every
    /// object the directory walk still reaches.
    pub deleted: bool,
}

impl Mapping {
    pub fn is_directory(&self) -> bool {
        matches!(self.info, MappingInfo::Directory { .. })
    }
}

/// Locate the mapping owning `cluster`. Mappings are sorted by `begin`
/// with disjoint half-open ranges.
pub fn find_for_cluster(mappings: &[Mapping], cluster: u32) -> Option<usize> {
    let index = mappings.partition_point(|m| m.begin <= cluster);
    let candidate = index.checked_sub(1)?;
    let mapping = &mappings[candidate];
    debug_assert!(mapping.begin < mapping.end);
    (cluster < mapping.end).then_some(candidate)
}

/// Locate a mapping by host path. Mappings are keyed by cluster, so
/// this is a linear scan.
pub fn find_for_path(mappings: &[Mapping], path: &Path) -> Option<usize> {
    mappings.iter().position(|m| m.path == path)
}

#[test]
fn cluster_lookup() {
    let mapping = |begin, end| Mapping {
        begin,
        end,
        ..Default::default()
    };
    let mappings = [mapping(0, 2), mapping(2, 5), mapping(9, 10)];

    assert_eq!(find_for_cluster(&mappings, 0), Some(0));
    assert_eq!(find_for_cluster(&mappings, 1), Some(0));
    assert_eq!(find_for_cluster(&mappings, 2), Some(1));
    assert_eq!(find_for_cluster(&mappings, 4), Some(1));
    assert_eq!(find_for_cluster(&mappings, 5), None);
    assert_eq!(find_for_cluster(&mappings, 8), None);
    assert_eq!(find_for_cluster(&mappings, 9), Some(2));
    assert_eq!(find_for_cluster(&mappings, 10), None);
}

#[test]
fn path_lookup() {
    let mut first = Mapping::default();
    first.path = PathBuf::from("/shadow/a.txt");
    let mut second = Mapping::default();
    second.path = PathBuf::from("/shadow/b.txt");
    let mappings = [first, second];

    assert_eq!(find_for_path(&mappings, Path::new("/shadow/b.txt")), Some(1));
    assert_eq!(find_for_path(&mappings, Path::new("/shadow/c.txt")), None);
}
