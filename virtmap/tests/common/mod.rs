use virtmap::{Options, VirtualMap};
use virtmap_core::hasher::Blake3Hasher;

pub struct TestMap {
    pub map: VirtualMap<Blake3Hasher>,
    _dir: tempfile::TempDir,
}

pub fn open_map(chunk_height: u32) -> TestMap {
    let dir = tempfile::tempdir().unwrap();
    let mut options = Options::new();
    options.path(dir.path());
    options.chunk_height(chunk_height);
    options.initial_buckets(16);
    TestMap {
        map: VirtualMap::open(&options).unwrap(),
        _dir: dir,
    }
}

/// Insert `count` deterministic keys, in a fixed order so two maps populated the
/// same way end up bit-identical.
pub fn populate(map: &mut VirtualMap<Blake3Hasher>, count: u32) {
    for n in 0..count {
        map.put(format!("key{}", n).as_bytes(), &n.to_le_bytes())
            .unwrap();
    }
}
