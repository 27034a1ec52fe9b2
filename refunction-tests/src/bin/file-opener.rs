use std::{env, fs::File, io::Write, mem, path::PathBuf, thread, time::Duration};

/// Opens, and never closes, a new file in the given directory every 20ms.
fn main() {
    let dir = PathBuf::from(env::args().nth(1).expect("usage: file-opener <dir>"));

    let mut count = 0;
    loop {
        let mut file = File::create(dir.join(format!("{count}.txt"))).expect("failed to create file");
        writeln!(file, "at: {count}").expect("failed to write file");
        mem::forget(file);

        println!("at: {count}");
        count += 1;
        thread::sleep(Duration::from_millis(20));
    }
}
