const SOCKET_NAME: &str = "crash-warden-watch-example";

use crash_warden::{Client, ClientOptions, LoopAction, MonitorStatus, Server};

fn main() {
    if std::env::args().any(|a| a == "--server") {
        let mut server = Server::with_name(SOCKET_NAME).expect("failed to create server");

        let ab = std::sync::atomic::AtomicBool::new(false);

        struct Handler;

        impl crash_warden::ServerHandler for Handler {
            /// Called on the loop thread when a monitored process has
            /// signaled a fault and is stopped inside its fault handler.
            fn capture_dump(
                &self,
                client: &crash_warden::ClientInfo<'_>,
            ) -> Result<(), std::io::Error> {
                println!(
                    "client {} faulted, fault block lives at {:#x}",
                    client.process_id, client.fault_context,
                );
                Ok(())
            }

            fn on_client_unregistered(&self, num_clients: usize) -> LoopAction {
                if num_clients == 0 {
                    LoopAction::Exit
                } else {
                    LoopAction::Continue
                }
            }
        }

        server
            .run(Box::new(Handler), &ab)
            .expect("failed to run server");

        return;
    }

    // Spawn ourselves in server mode. The child exits on its own once its
    // last client unregisters, so there is nothing to wait on.
    let exe = std::env::current_exe().expect("unable to find ourselves");
    let _server_proc = std::process::Command::new(exe)
        .arg("--server")
        .spawn()
        .expect("unable to spawn server process");

    let client = Client::register(SOCKET_NAME, ClientOptions::default());

    match client.wait_for_registration(std::time::Duration::from_secs(10)) {
        MonitorStatus::Monitored => println!("registered with the supervisor"),
        status => panic!(
            "registration settled at {status:?}: {:?}",
            client.last_error()
        ),
    }

    // Take the whole process down with SIGABRT. The supervisor observes the
    // fault and prints the report while we sit in the rendezvous.
    std::process::abort();
}
