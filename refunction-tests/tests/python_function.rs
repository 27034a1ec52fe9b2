use refunction_common::{
    nix::sys::signal::Signal,
    serde_json::{json, Value},
};
use refunction_tests::util::{init, python_worker};

const ECHO: &str = "def handle(req):\n    return req\n";

#[test]
fn it_echoes_requests() {
    init();
    let Some(mut worker) = python_worker() else {
        return;
    };

    worker.activate().unwrap();
    assert_eq!(worker.controller().checkpoints().len(), 1);

    worker.send_function(ECHO).unwrap();
    let response = worker.send_request(json!("jsonstring")).unwrap();
    assert_eq!(response, json!("jsonstring"));

    let response = worker.send_request(json!({"nested": [1, 2]})).unwrap();
    assert_eq!(response, json!({"nested": [1, 2]}));

    worker.end().unwrap();
}

#[test]
fn it_forgets_the_handler_after_restore() {
    init();
    let Some(mut worker) = python_worker() else {
        return;
    };

    worker.activate().unwrap();
    worker.send_function(ECHO).unwrap();
    assert_eq!(worker.send_request(json!("first")).unwrap(), json!("first"));

    // the runtime is blocked in a read, the signal only interrupts it
    worker.controller().send_signal(Signal::SIGUSR2).unwrap();
    worker.controller().await_signal(Signal::SIGUSR2).unwrap();
    worker.restore().unwrap();

    worker
        .send_function("def handle(req):\n    return 'unrelated'\n")
        .unwrap();
    assert_eq!(
        worker.send_request(json!("second")).unwrap(),
        json!("unrelated")
    );

    worker.end().unwrap();
}

#[test]
fn it_imports_modules_after_restore() {
    init();
    let Some(mut worker) = python_worker() else {
        return;
    };

    worker.activate().unwrap();
    worker
        .send_function("import math\ndef handle(req):\n    return math.ceil(req)\n")
        .unwrap();
    assert_eq!(worker.send_request(json!(3.5)).unwrap(), json!(4));

    worker.restore().unwrap();
    worker
        .send_function("import string\ndef handle(req):\n    return string.ascii_lowercase\n")
        .unwrap();
    assert_eq!(
        worker.send_request(Value::Null).unwrap(),
        json!("abcdefghijklmnopqrstuvwxyz")
    );

    worker.end().unwrap();
}

#[test]
fn it_shrinks_the_heap_back() {
    init();
    let Some(mut worker) = python_worker() else {
        return;
    };

    worker.activate().unwrap();
    let hungry = "\
import random
kept = []
def handle(req):
    for _ in range(10):
        kept.append(str(random.random()) + 'x' * 100000)
    return len(random.choice(kept))
";
    worker.send_function(hungry).unwrap();
    for _ in 0..5 {
        let len = worker.send_request(Value::Null).unwrap();
        assert!(len.as_u64().unwrap() > 100_000);
    }

    worker.controller().stop_all().unwrap();
    let checkpoint = worker.controller().initial_checkpoint().unwrap();
    assert!(checkpoint.program_break_changed().unwrap());
    assert!(checkpoint.memory_changed().unwrap());
    worker.controller().continue_all().unwrap();

    worker.restore().unwrap();
    worker.controller().stop_all().unwrap();
    let checkpoint = worker.controller().initial_checkpoint().unwrap();
    assert!(!checkpoint.program_break_changed().unwrap());
    assert!(!checkpoint.memory_changed().unwrap());
    worker.controller().continue_all().unwrap();

    worker.send_function(ECHO).unwrap();
    assert_eq!(worker.send_request(json!(7)).unwrap(), json!(7));

    worker.end().unwrap();
}

#[test]
fn it_reports_functions_that_fail_to_load() {
    init();
    let Some(mut worker) = python_worker() else {
        return;
    };

    worker.activate().unwrap();
    let err = worker
        .send_function("function handle(req) { return req; }")
        .unwrap_err();
    assert_eq!(err.to_string(), "function failed to load");

    worker.send_function(ECHO).unwrap();
    assert_eq!(worker.send_request(json!([1])).unwrap(), json!([1]));

    worker.end().unwrap();
}
