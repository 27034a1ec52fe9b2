use std::{env, ptr, thread, time::Duration};

use refunction_common::libc;

/// No such syscall, the kernel answers with ENOSYS.
const MISSING_SYSCALL: libc::c_long = 100_000;

fn main() {
    let missing_syscall = env::args().any(|a| a == "--missing-syscall");

    let mut i: u64 = 0;
    loop {
        // keep the counter in its stack slot
        unsafe { ptr::write_volatile(&mut i, ptr::read_volatile(&i) + 1) };
        if missing_syscall {
            unsafe { libc::syscall(MISSING_SYSCALL) };
        }
        println!("at: {i}");

        thread::sleep(Duration::from_millis(50));
    }
}
