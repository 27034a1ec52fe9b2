use std::{process, thread, time::Duration};

use refunction::{ptrace::TaskState, Controller};
use refunction_tests::util::{counters, init, spawn, wait_for_output, ChildWithStreamedOutput};

fn growing_heap(args: &[&str]) -> ChildWithStreamedOutput {
    let child = spawn(process::Command::new(env!("CARGO_BIN_EXE_growing-heap")).args(args));
    wait_for_output(&child, "grown: 2 ");
    child
}

struct Progress {
    prefix: &'static str,
    reached: u64,
    output_len: usize,
}

/// Lets the tracee run past its checkpoint, then stops it and waits for its
/// output to drain.
fn run_past_checkpoint(
    child: &ChildWithStreamedOutput,
    controller: &Controller,
    prefix: &'static str,
) -> Progress {
    thread::sleep(Duration::from_millis(300));
    controller.stop_all().unwrap();
    thread::sleep(Duration::from_millis(50));

    let output = child.stdout();
    Progress {
        prefix,
        reached: counters(&output, prefix).into_iter().max().unwrap(),
        output_len: output.len(),
    }
}

/// Asserts the tracee picks up from its checkpoint: the first counter printed
/// after the stop is lower than what it had already reached.
fn assert_rewound(child: &ChildWithStreamedOutput, progress: Progress) {
    let Progress {
        prefix,
        reached,
        output_len: before,
    } = progress;
    let mut resumed = vec![];
    for _ in 0..500 {
        resumed = counters(&child.stdout()[before..], prefix);
        if !resumed.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!resumed.is_empty(), "no output after restore");
    assert!(resumed[0] < reached, "resumed at {} after {reached}", resumed[0]);
}

#[test]
fn it_rolls_back_the_program_break() {
    init();
    let child = growing_heap(&[]);

    let mut controller = Controller::new(child.pid());
    controller.attach().unwrap();
    controller.take_checkpoint().unwrap();
    let progress = run_past_checkpoint(&child, &controller, "grown: ");

    let checkpoint = controller.initial_checkpoint().unwrap();
    assert!(checkpoint.program_break_changed().unwrap());
    assert!(checkpoint.memory_changed().unwrap());

    let leader = controller.task(child.pid()).unwrap();
    checkpoint.restore_program_break(leader).unwrap();
    assert!(!checkpoint.program_break_changed().unwrap());
    assert!(!checkpoint.memory_changed().unwrap());

    checkpoint.fixup_syscall_state(leader).unwrap();
    checkpoint.restore_dirty_pages().unwrap();
    checkpoint.restore_registers(controller.tasks()).unwrap();
    controller.continue_all().unwrap();

    assert_rewound(&child, progress);
    controller.end().unwrap();
}

#[test]
fn it_unmaps_regions_mapped_after_checkpoint() {
    init();
    let child = growing_heap(&["--mmap"]);

    let mut controller = Controller::new(child.pid());
    controller.attach().unwrap();
    controller.take_checkpoint().unwrap();
    let progress = run_past_checkpoint(&child, &controller, "grown: ");

    let checkpoint = controller.initial_checkpoint().unwrap();
    assert!(checkpoint.num_memory_locations_changed().unwrap());

    let leader = controller.task(child.pid()).unwrap();
    checkpoint.unmap_new_locations(leader).unwrap();
    assert!(!checkpoint.num_memory_locations_changed().unwrap());

    checkpoint.fixup_syscall_state(leader).unwrap();
    checkpoint.restore_dirty_pages().unwrap();
    checkpoint.restore_registers(controller.tasks()).unwrap();
    controller.continue_all().unwrap();

    assert_rewound(&child, progress);
    controller.end().unwrap();
}

#[test]
fn it_restores_repeatedly() {
    init();
    let child = growing_heap(&[]);

    let mut controller = Controller::new(child.pid());
    controller.attach().unwrap();
    controller.take_checkpoint().unwrap();

    for _ in 0..3 {
        let progress = run_past_checkpoint(&child, &controller, "grown: ");
        controller.restore().unwrap();

        controller.stop_all().unwrap();
        let checkpoint = controller.initial_checkpoint().unwrap();
        assert!(!checkpoint.program_break_changed().unwrap());
        assert!(!checkpoint.memory_changed().unwrap());
        controller.continue_all().unwrap();

        assert_rewound(&child, progress);
    }

    controller.end().unwrap();
}

#[test]
fn it_restores_every_thread() {
    init();
    let child = spawn(&mut process::Command::new(env!("CARGO_BIN_EXE_threaded-counter")));
    wait_for_output(&child, "at: 2 ");

    let mut controller = Controller::new(child.pid());
    controller.attach().unwrap();
    assert_eq!(controller.tasks().len(), 4);
    assert_eq!(controller.tasks()[0].tid(), child.pid());

    controller.take_checkpoint().unwrap();
    let checkpoint = controller.initial_checkpoint().unwrap();
    for task in controller.tasks() {
        assert!(checkpoint.registers(task.tid()).is_some(), "{}", task.tid());
    }

    for _ in 0..3 {
        let progress = run_past_checkpoint(&child, &controller, "at: ");
        controller.restore().unwrap();
        assert_rewound(&child, progress);

        for task in controller.tasks() {
            assert_eq!(task.state(), TaskState::Running, "{}", task.tid());
        }
    }

    controller.end().unwrap();
}
