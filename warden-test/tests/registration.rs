//! Exercises the registration exchange itself: identity checks, malformed
//! packets, and how much abuse the endpoint shrugs off.

use warden_test::*;

#[test]
fn rejects_pid_below_reserved_floor() {
    capture_output();

    let server = spinup_server(&unique_id("floor"));

    let request = crash_warden::RegistrationRequest::new(2, 2, 0x1000);
    let reply = raw_exchange(&server.socket, request.as_bytes());
    assert!(reply.is_none(), "a reserved pid must not be acked");

    // the endpoint keeps serving
    let output = run_crash_client(&server.socket, ClientMode::CleanExit);
    assert!(output.status.success());
}

#[test]
fn rejects_mismatched_pid() {
    capture_output();

    let server = spinup_server(&unique_id("mismatch"));

    // the connection is ours, so claiming any other pid is a forgery
    let request = crash_warden::RegistrationRequest::new(std::process::id() + 1, gettid(), 0);
    let reply = raw_exchange(&server.socket, request.as_bytes());
    assert!(reply.is_none(), "a forged pid must not be acked");
}

#[test]
fn rejects_garbage_packets() {
    capture_output();

    let server = spinup_server(&unique_id("garbage"));

    let request = crash_warden::RegistrationRequest::new(std::process::id(), gettid(), 0);
    let mut wrong_magic = request.as_bytes().to_vec();
    wrong_magic[..8].copy_from_slice(b"NOTMINE1");
    assert!(raw_exchange(&server.socket, &wrong_magic).is_none());

    assert!(raw_exchange(&server.socket, &[1, 2, 3]).is_none());

    assert!(raw_exchange(&server.socket, &[0u8; 128]).is_none());

    // a well formed registration still goes through afterwards
    let output = run_crash_client(&server.socket, ClientMode::CleanExit);
    assert!(output.status.success());
}

#[test]
fn connection_dropped_midway_is_isolated() {
    capture_output();

    let server = spinup_server(&unique_id("dropped"));

    // connect and say nothing
    drop(raw_connect(&server.socket));

    // connect, register, vanish without reading the ack
    let conn = raw_connect(&server.socket);
    let request = crash_warden::RegistrationRequest::new(std::process::id(), gettid(), 0x2000);
    conn.send(request.as_bytes()).expect("failed to send");
    drop(conn);

    // neither connection took the listeners down
    let output = run_crash_client(&server.socket, ClientMode::CleanExit);
    assert!(output.status.success());
}

#[test]
fn same_pid_can_register_repeatedly() {
    capture_output();

    let server = spinup_server(&unique_id("samepid"));

    let request = crash_warden::RegistrationRequest::new(std::process::id(), gettid(), 0x3000);

    let first = raw_exchange(&server.socket, request.as_bytes());
    let second = raw_exchange(&server.socket, request.as_bytes());

    for reply in [first, second] {
        let bytes = reply.expect("registration should have been acked");
        let ack =
            crash_warden::RegistrationAck::from_bytes(&bytes).expect("ack had the wrong size");
        assert_eq!(ack.magic, crash_warden::RegistrationAck::MAGIC);
        assert_ne!(ack.dump_request_handle, ack.dump_done_handle);
    }

    // each connection produced its own record
    assert_eq!(
        server
            .registered_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("first registration was never applied"),
        1
    );
    assert_eq!(
        server
            .registered_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("second registration was never applied"),
        2
    );
}

#[test]
fn fault_handler_occupancy_is_per_process() {
    capture_output();

    let server = spinup_server(&unique_id("occupancy"));
    let options = crash_warden::ClientOptions::default();
    let patience = std::time::Duration::from_secs(10);

    let first = crash_warden::Client::register(server.socket.as_str(), options);
    assert_eq!(
        first.wait_for_registration(patience),
        crash_warden::MonitorStatus::Monitored
    );

    // a second registration in the same process is refused locally, after
    // the protocol itself succeeded
    let second = crash_warden::Client::register(server.socket.as_str(), options);
    assert_eq!(
        second.wait_for_registration(patience),
        crash_warden::MonitorStatus::Unmonitored
    );
    assert!(second
        .last_error()
        .expect("a failed registration must say why")
        .contains("already installed"));

    drop(second);
    drop(first);

    // with the first client gone the slot frees up again
    let third = crash_warden::Client::register(server.socket.as_str(), options);
    assert_eq!(
        third.wait_for_registration(patience),
        crash_warden::MonitorStatus::Monitored
    );
}
