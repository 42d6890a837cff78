//! Integration tests for memory pool bounds and blocking acquisition.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use blobmount_blockcache::{FileHandle, OpenFlags};
use common::{pattern, small_options, Harness, BLOCK};

#[test]
fn test_open_waits_for_a_released_block() {
    let h: Harness = Harness::new(small_options().with_pool_blocks(2).with_prefetch(0));
    for name in ["a.txt", "b.txt", "c.txt"] {
        h.backend.insert_file(name, name.as_bytes().repeat(10));
    }

    let a: Arc<FileHandle> = h.cache.open_file("a.txt", OpenFlags::read_only()).unwrap();
    let b: Arc<FileHandle> = h.cache.open_file("b.txt", OpenFlags::read_only()).unwrap();
    assert_eq!(h.cache.stats().pool.outstanding_blocks, 2);

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<Arc<FileHandle>>();
        let cache = &h.cache;
        scope.spawn(move || {
            let c: Arc<FileHandle> = cache.open_file("c.txt", OpenFlags::read_only()).unwrap();
            tx.send(c).unwrap();
        });

        // Both blocks are held by open handles
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(h.cache.stats().pool.waiters, 1);

        h.cache.close_file(&a).unwrap();
        let c: Arc<FileHandle> = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut buf: Vec<u8> = vec![0u8; 64];
        let n: usize = h.cache.read_in_buffer(&c, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], "c.txt".repeat(10).as_bytes());
        h.cache.close_file(&c).unwrap();
    });

    h.cache.close_file(&b).unwrap();
    assert_eq!(h.cache.stats().pool.outstanding_blocks, 0);
}

#[test]
fn test_pool_bound_holds_under_concurrent_readers() {
    let h: Harness = Harness::new(small_options().with_pool_blocks(8).with_prefetch(4));
    let files: Vec<(String, Vec<u8>)> = (0..4u8)
        .map(|i| (format!("dir/file-{}.bin", i), pattern(10 * BLOCK as usize, i)))
        .collect();
    for (path, data) in &files {
        h.backend.insert_file(path.clone(), data.clone());
    }

    let done = AtomicBool::new(false);
    let peak = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let (h, done, peak) = (&h, &done, &peak);
        scope.spawn(move || {
            while !done.load(Ordering::Acquire) {
                let outstanding: usize = h.cache.stats().pool.outstanding_blocks;
                peak.fetch_max(outstanding, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let readers: Vec<_> = files
            .iter()
            .map(|(path, data)| {
                scope.spawn(move || {
                    let handle: Arc<FileHandle> =
                        h.cache.open_file(path, OpenFlags::read_only()).unwrap();
                    let mut out: Vec<u8> = Vec::new();
                    let mut buf: Vec<u8> = vec![0u8; 1500];
                    loop {
                        let n: usize = h
                            .cache
                            .read_in_buffer(&handle, out.len() as u64, &mut buf)
                            .unwrap();
                        if n == 0 {
                            break;
                        }
                        out.extend_from_slice(&buf[..n]);
                    }
                    h.cache.close_file(&handle).unwrap();
                    assert_eq!(&out, data);
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert!(peak.load(Ordering::Relaxed) <= 8);
    assert_eq!(h.cache.stats().pool.outstanding_blocks, 0);
    assert_eq!(h.cache.open_handles(), 0);
}

#[test]
fn test_writer_stages_its_own_blocks_when_pool_is_full() {
    let h: Harness = Harness::new(small_options().with_pool_blocks(2).with_prefetch(0));
    let data: Vec<u8> = pattern(6 * BLOCK as usize, 42);

    let handle: Arc<FileHandle> = h.cache.create_file("tight.bin", 0o644).unwrap();
    h.cache.write_file(&handle, 0, &data).unwrap();
    assert!(h.cache.stats().pool.outstanding_blocks <= 2);

    h.cache.close_file(&handle).unwrap();
    assert_eq!(h.backend.contents("tight.bin").unwrap(), data);
}
