use std::{env, ptr, thread, time::Duration};

use refunction_common::libc;

const CHUNK: usize = 100_000;
const MAPPING: usize = 1 << 20;

/// Grows the program break, or with `--mmap` adds fresh mappings, every 50ms.
fn main() {
    let mmap = env::args().any(|a| a == "--mmap");

    let mut grown: u64 = 0;
    loop {
        if mmap {
            map_region();
        } else {
            let _ = Box::leak(vec![1u8; CHUNK].into_boxed_slice());
        }
        grown += 1;
        println!("grown: {grown} break: {:p}", unsafe { libc::sbrk(0) });

        thread::sleep(Duration::from_millis(50));
    }
}

/// Maps a writable region with a trailing guard page so that neighbouring
/// mappings never merge.
fn map_region() {
    unsafe {
        let addr = libc::mmap(
            ptr::null_mut(),
            MAPPING + 4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(addr, libc::MAP_FAILED);
        *(addr as *mut u8) = 1;
        libc::mprotect(addr.add(MAPPING), 4096, libc::PROT_NONE);
    }
}
