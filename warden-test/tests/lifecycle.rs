//! Whole-lifetime scenarios with real child processes: fault capture,
//! rendezvous release, and teardown when clients exit by any means.

use std::time::Duration;
use warden_test::*;

#[test]
fn captures_fault_and_tears_down() {
    capture_output();

    let server = spinup_server(&unique_id("fault"));

    let child = spawn_crash_client(&server.socket, ClientMode::Segv);
    let child_pid = child.id();

    let output = child.wait_with_output().expect("failed to wait for output");
    println!("{}", String::from_utf8_lossy(&output.stdout));
    eprintln!("{}", String::from_utf8_lossy(&output.stderr));

    // the client died from its signal, not from an error path
    assert!(output.status.code().is_none());

    let fault = server
        .fault_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("fault was never captured");

    assert_eq!(fault.block.process_id, child_pid);
    assert_eq!(fault.block.signal, libc::SIGSEGV);
    assert_ne!(fault.block.faulting_thread, 0);

    let artifact_len = std::fs::metadata(&fault.artifact)
        .expect("artifact missing")
        .len();
    assert_eq!(
        artifact_len as usize,
        std::mem::size_of::<crash_warden::FaultBlock>()
    );

    // the faulted process is gone, so its record goes away on its own
    assert_eq!(
        server
            .unregistered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("client was never torn down"),
        0
    );

    // and the fault was reported exactly once
    assert!(server
        .fault_rx
        .recv_timeout(Duration::from_millis(500))
        .is_err());
}

#[test]
fn clean_exit_unregisters_without_capture() {
    capture_output();

    let server = spinup_server(&unique_id("clean"));

    let output = run_crash_client(&server.socket, ClientMode::CleanExit);
    assert!(output.status.success());

    assert_eq!(
        server
            .registered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("registration was never applied"),
        1
    );
    assert_eq!(
        server
            .unregistered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("client was never torn down"),
        0
    );
    assert!(server
        .fault_rx
        .recv_timeout(Duration::from_millis(500))
        .is_err());
}

#[test]
fn killed_client_unregisters() {
    capture_output();

    let server = spinup_server(&unique_id("killed"));

    let mut child = spawn_crash_client(&server.socket, ClientMode::Linger);

    assert_eq!(
        server
            .registered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("registration was never applied"),
        1
    );

    // SIGKILL, so no handler gets a say on the client side
    child.kill().expect("failed to kill crash-client");
    let status = child.wait().expect("failed to wait for crash-client");
    assert!(status.code().is_none());

    assert_eq!(
        server
            .unregistered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("client was never torn down"),
        0
    );
    assert!(server
        .fault_rx
        .recv_timeout(Duration::from_millis(500))
        .is_err());
}

#[test]
fn monitors_several_clients_at_once() {
    capture_output();

    let server = spinup_server(&unique_id("several"));

    let mut lingerers = vec![
        spawn_crash_client(&server.socket, ClientMode::Linger),
        spawn_crash_client(&server.socket, ClientMode::Linger),
    ];

    for expected in 1..=2 {
        assert_eq!(
            server
                .registered_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("registration was never applied"),
            expected
        );
    }

    let crasher = spawn_crash_client(&server.socket, ClientMode::Segv);
    let crasher_pid = crasher.id();

    assert_eq!(
        server
            .registered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("crasher registration was never applied"),
        3
    );

    let output = crasher.wait_with_output().expect("failed to wait for output");
    assert!(output.status.code().is_none());

    // exactly one fault, from the client that actually crashed
    let fault = server
        .fault_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("fault was never captured");
    assert_eq!(fault.block.process_id, crasher_pid);

    // only the faulted client went away
    assert_eq!(
        server
            .unregistered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("crasher was never torn down"),
        2
    );

    for lingerer in &mut lingerers {
        lingerer.kill().expect("failed to kill crash-client");
        lingerer.wait().expect("failed to wait for crash-client");
    }

    // both teardowns arrive, in whichever order their exits were noticed
    let mut remaining: Vec<_> = (0..2)
        .map(|_| {
            server
                .unregistered_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("lingerer was never torn down")
        })
        .collect();
    remaining.sort_unstable();
    assert_eq!(remaining, [0, 1]);

    assert!(server
        .fault_rx
        .recv_timeout(Duration::from_millis(500))
        .is_err());
}
