//! The three-thread counter scenario, scaled down from 100,000
//! iterations/thread to keep the test suite fast. Exercises each runtime
//! end to end: open a region, allocate a root cell, race several threads
//! through `update_tx`, and check the final count matches
//! `threads * iters` exactly — the serializability every commit protocol
//! here must provide.

use std::sync::Arc;

use trinity_ptm::runtime::{fc, tl2, vr_tl2};
use trinity_ptm::Runtime;

const THREADS: usize = 3;
const ITERS: usize = 2000;

fn fresh_path(name: &str) -> String {
    format!("/tmp/trinity-ptm-it-{name}-{}", std::process::id())
}

#[test]
fn fc_three_thread_counter() {
    let path = fresh_path("fc-counter");
    std::fs::remove_file(&path).ok();
    let rt = Arc::new(fc::FcRuntime::open_sized(&path, 4 * 1024 * 1024).expect("open"));
    let off = rt.update_tx(|tx| tx.malloc(8).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const fc::Cell<u64>) };
                for _ in 0..ITERS {
                    rt.update_tx(|tx| {
                        use trinity_ptm::cell::PersistentCell;
                        let v = cell.load(tx);
                        cell.store(tx, v + 1);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const fc::Cell<u64>) };
    assert_eq!(rt.read_tx(|tx| cell.read(tx)), (THREADS * ITERS) as u64);
}

#[test]
fn tl2_three_thread_counter() {
    let path = fresh_path("tl2-counter");
    std::fs::remove_file(&path).ok();
    let rt = Arc::new(tl2::Tl2Runtime::open_sized(&path, 4 * 1024 * 1024).expect("open"));
    let off = rt.update_tx(|tx| tx.malloc(8).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const tl2::Cell<u64>) };
                for _ in 0..ITERS {
                    rt.update_tx(|tx| {
                        use trinity_ptm::cell::PersistentCell;
                        let v = cell.load_for_write(tx);
                        cell.store(tx, v + 1);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const tl2::Cell<u64>) };
    assert_eq!(rt.read_tx(|tx| cell.read(tx)), (THREADS * ITERS) as u64);
}

#[test]
fn vr_tl2_three_thread_counter() {
    let path = fresh_path("vrtl2-counter");
    std::fs::remove_file(&path).ok();
    let rt = Arc::new(vr_tl2::VrTl2Runtime::open_sized(&path, 4 * 1024 * 1024).expect("open"));
    let off = rt.update_tx(|tx| tx.malloc(8).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let cell =
                    unsafe { &*(rt.base_ptr().add(off as usize) as *const vr_tl2::Cell<u64>) };
                for _ in 0..ITERS {
                    rt.update_tx(|tx| {
                        use trinity_ptm::cell::PersistentCell;
                        let v = cell.load_for_write(tx);
                        cell.store(tx, v + 1);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const vr_tl2::Cell<u64>) };
    assert_eq!(rt.read_tx(|tx| cell.read(tx)), (THREADS * ITERS) as u64);
}
