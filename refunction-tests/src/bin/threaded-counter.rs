use std::{
    ptr,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

const WORKERS: usize = 3;

static TICKS: AtomicU64 = AtomicU64::new(0);

fn main() {
    for _ in 0..WORKERS {
        thread::spawn(|| {
            let mut local: u64 = 0;
            loop {
                unsafe { ptr::write_volatile(&mut local, ptr::read_volatile(&local) + 1) };
                TICKS.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
            }
        });
    }

    let mut i: u64 = 0;
    loop {
        unsafe { ptr::write_volatile(&mut i, ptr::read_volatile(&i) + 1) };
        println!("at: {i} ticks: {}", TICKS.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(50));
    }
}
