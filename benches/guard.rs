#![feature(test)]

extern crate test;

use test::Bencher;

use lockfree_collections::NonBlockingMap;

/// Benchmarks the hazard-protected read path: acquiring and publishing a
/// hazard pointer for the map's top generation, then for the looked-up
/// value itself, on every `get`.
#[bench]
fn stable_read_and_get(b: &mut Bencher) {
    let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
    map.put(1, 1);

    b.iter(|| {
        assert_eq!(map.get(&1), Some(1));
    })
}
