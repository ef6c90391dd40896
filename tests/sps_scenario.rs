//! The SPS (swap performance sum) scenario, scaled down from
//! N=10,000,000 cells to a few thousand so the suite runs fast. Builds an
//! array of cells, seeds `A[i] = i`, has several threads repeatedly swap
//! random pairs through `update_tx`, and checks the sum invariant
//! `sum(A) == N*(N-1)/2` holds no matter how the swaps interleaved.

use std::sync::Arc;

use rand::Rng;

use trinity_ptm::cell::PersistentCell;
use trinity_ptm::runtime::tl2;
use trinity_ptm::Runtime;

const N: usize = 2000;
const THREADS: usize = 4;
const SWAPS_PER_THREAD: usize = 1000;

#[test]
fn tl2_sps_sum_invariant_holds_under_concurrent_swaps() {
    let path = format!("/tmp/trinity-ptm-it-sps-{}", std::process::id());
    std::fs::remove_file(&path).ok();
    let rt = Arc::new(tl2::Tl2Runtime::open_sized(&path, 16 * 1024 * 1024).expect("open"));

    let mut offsets = Vec::with_capacity(N);
    for i in 0..N {
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const tl2::Cell<u64>) };
        rt.update_tx(move |tx| cell.store(tx, i as u64));
        offsets.push(off);
    }
    let offsets = Arc::new(offsets);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let rt = rt.clone();
            let offsets = offsets.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..SWAPS_PER_THREAD {
                    let a = rng.gen_range(0..N);
                    let b = rng.gen_range(0..N);
                    let rt2 = rt.clone();
                    let offsets = offsets.clone();
                    rt.update_tx(move |tx| {
                        let rt = &rt2;
                        let cell_a =
                            unsafe { &*(rt.base_ptr().add(offsets[a] as usize) as *const tl2::Cell<u64>) };
                        let cell_b =
                            unsafe { &*(rt.base_ptr().add(offsets[b] as usize) as *const tl2::Cell<u64>) };
                        let va = cell_a.load_for_write(tx);
                        let vb = cell_b.load_for_write(tx);
                        cell_a.store(tx, vb);
                        cell_b.store(tx, va);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let sum: u64 = offsets
        .iter()
        .map(|&off| {
            let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const tl2::Cell<u64>) };
            rt.read_tx(|tx| cell.read(tx))
        })
        .sum();
    let expected = (N as u64) * (N as u64 - 1) / 2;
    assert_eq!(sum, expected);
}
