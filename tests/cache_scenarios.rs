//! End-to-end scenarios over the public API.

use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use rendercache::{
    Cache, CacheConfig, CacheEntry, CacheEntryPtr, DeserializeStatus, EntryStatus, PropertyMap,
    PropertyValue, Result,
};

struct FrameEntry {
    hash: u64,
    size: usize,
    pixels: Mutex<Vec<u8>>,
}

impl FrameEntry {
    fn computed(hash: u64, size: usize) -> Arc<Self> {
        Arc::new(FrameEntry {
            hash,
            size,
            pixels: Mutex::new((0..size).map(|i| (i as u8) ^ (hash as u8)).collect()),
        })
    }

    fn template(hash: u64, size: usize) -> Arc<Self> {
        Arc::new(FrameEntry {
            hash,
            size,
            pixels: Mutex::new(Vec::new()),
        })
    }
}

impl CacheEntry for FrameEntry {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn metadata_size(&self) -> usize {
        self.size
    }

    fn plugin_id(&self) -> &str {
        "net.test.frame"
    }

    fn serialize(&self, props: &mut PropertyMap) -> Result<()> {
        props.set_u64("frame_hash", self.hash);
        props.set_bytes("pixels", &self.pixels.lock().unwrap());
        Ok(())
    }

    fn deserialize(&self, props: &PropertyMap, _has_write_rights: bool) -> DeserializeStatus {
        if props.get_u64("frame_hash") != Some(self.hash) {
            return DeserializeStatus::Failed;
        }
        match props.get_bytes("pixels") {
            Some(bytes) => {
                *self.pixels.lock().unwrap() = bytes.to_vec();
                DeserializeStatus::Ok
            }
            None => DeserializeStatus::Failed,
        }
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_cache(maximum: u64) -> Cache {
    init_logs();
    Cache::open(
        CacheConfig::in_memory()
            .with_maximum_size(maximum)
            .with_tile_storage(false),
    )
    .unwrap()
}

#[test]
fn basic_insert_lookup_round_trip() {
    let cache = small_cache(1024);
    let hash = 0x1100_0000_0000_0001;

    let mut locker = cache.get(FrameEntry::computed(hash, 128) as CacheEntryPtr);
    assert_eq!(locker.status(), EntryStatus::MustCompute);
    locker.insert();

    assert_eq!(cache.current_size(), 128);
    assert!(cache.has(hash));
    let locker = cache.get(FrameEntry::template(hash, 128) as CacheEntryPtr);
    assert_eq!(locker.status(), EntryStatus::Cached);
    assert_eq!(locker.entry().hash(), hash);
}

#[test]
fn producer_and_waiter_agree_on_one_compute() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        Cache::open(
            CacheConfig::persistent(dir.path())
                .with_maximum_size(1 << 20)
                .with_tile_storage(false),
        )
        .unwrap(),
    );
    let hash = 0x2200_0000_0000_0002;
    let barrier = Arc::new(Barrier::new(2));

    let mut workers = Vec::new();
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        workers.push(std::thread::spawn(move || {
            barrier.wait();
            let mut locker = cache.get(FrameEntry::computed(hash, 256) as CacheEntryPtr);
            match locker.status() {
                EntryStatus::MustCompute => {
                    // Simulate an expensive render before publishing.
                    std::thread::sleep(Duration::from_millis(200));
                    locker.insert();
                    (true, Duration::ZERO)
                }
                EntryStatus::ComputationPending => {
                    let start = Instant::now();
                    let status = locker.wait_for_pending(Some(Duration::from_secs(10)));
                    assert_eq!(status, EntryStatus::Cached);
                    (false, start.elapsed())
                }
                EntryStatus::Cached => (false, Duration::ZERO),
            }
        }));
    }

    let results: Vec<(bool, Duration)> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let producers = results.iter().filter(|(p, _)| *p).count();
    assert_eq!(producers, 1, "exactly one thread must compute");
    // The waiter resolves shortly after the 200 ms production.
    for (produced, waited) in results {
        if !produced {
            assert!(waited < Duration::from_secs(2), "waited {waited:?}");
        }
    }
    assert_eq!(cache.current_size(), 256);
}

#[test]
fn concurrent_cohort_has_exactly_one_producer() {
    let cache = Arc::new(small_cache(1 << 20));
    let hash = 0x3300_0000_0000_0003;
    let n = 8;
    let barrier = Arc::new(Barrier::new(n));

    let mut workers = Vec::new();
    for _ in 0..n {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        workers.push(std::thread::spawn(move || {
            barrier.wait();
            let mut locker = cache.get(FrameEntry::computed(hash, 64) as CacheEntryPtr);
            match locker.status() {
                EntryStatus::MustCompute => {
                    std::thread::sleep(Duration::from_millis(50));
                    locker.insert();
                    1u32
                }
                EntryStatus::ComputationPending => {
                    assert_eq!(
                        locker.wait_for_pending(Some(Duration::from_secs(10))),
                        EntryStatus::Cached
                    );
                    0
                }
                EntryStatus::Cached => 0,
            }
        }));
    }

    let producers: u32 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(producers, 1);
    assert_eq!(cache.current_size(), 64);
}

#[test]
fn waiter_takes_over_after_timeout() {
    let cache = Arc::new(small_cache(1 << 20));
    let hash = 0x4400_0000_0000_0004;

    // The producer claims the entry and stalls without publishing.
    let producer = cache.get(FrameEntry::computed(hash, 64) as CacheEntryPtr);
    assert_eq!(producer.status(), EntryStatus::MustCompute);

    let waiter_cache = Arc::clone(&cache);
    let waiter = std::thread::spawn(move || {
        let mut locker = waiter_cache.get(FrameEntry::computed(hash, 64) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::ComputationPending);
        locker.wait_for_pending(Some(Duration::from_millis(300)))
    });

    assert_eq!(waiter.join().unwrap(), EntryStatus::MustCompute);
    drop(producer);
}

#[test]
fn eviction_monotonicity() {
    let cache = small_cache(1 << 20);
    for i in 0..32u64 {
        let hash = (i << 56) | 0x10 | i;
        let mut locker = cache.get(FrameEntry::computed(hash, 1000) as CacheEntryPtr);
        locker.insert();
    }
    let before = cache.current_size();
    cache.evict_lru(8 << 10);
    let after = cache.current_size();
    assert!(after <= before);
    assert!(after <= (1u64 << 20) - (8 << 10));
}

#[test]
fn clear_twice_is_observationally_clear_once() {
    let cache = small_cache(1 << 20);
    for i in 0..8u64 {
        let mut locker =
            cache.get(FrameEntry::computed((i << 56) | i, 100) as CacheEntryPtr);
        locker.insert();
    }
    cache.clear();
    let size_once = cache.current_size();
    let stats_once = cache.memory_stats();
    cache.clear();
    assert_eq!(cache.current_size(), size_once);
    assert_eq!(cache.memory_stats(), stats_once);
    assert_eq!(size_once, 0);
}

#[test]
fn property_map_round_trip_preserves_hash() {
    let mut props = PropertyMap::new();
    props.set_str("layer", "beauty");
    props.set("window", PropertyValue::Int(vec![0, 0, 1920, 1080]));
    props.set_f64("par", 1.0);

    let hash = 0xfeed_face_dead_beef;
    let blob = props.encode(hash);
    let decoded = PropertyMap::decode(&blob, hash).unwrap();
    assert_eq!(props, decoded);
    assert!(PropertyMap::decode(&blob, hash ^ 1).is_err());
}

#[test]
fn maximum_size_can_be_retuned_at_runtime() {
    let cache = small_cache(1 << 20);
    assert_eq!(cache.maximum_size(), 1 << 20);
    for i in 0..16u64 {
        let mut locker =
            cache.get(FrameEntry::computed((i << 56) | 0x20 | i, 1000) as CacheEntryPtr);
        locker.insert();
    }
    cache.set_maximum_size(4000);
    cache.evict_lru(0);
    assert!(cache.current_size() <= 4000);
}
