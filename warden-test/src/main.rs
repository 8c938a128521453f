use clap::Parser;

#[derive(Parser)]
struct Command {
    /// Runs the supervisor side on the socket instead of a monitored
    /// workload
    #[clap(long)]
    server: bool,
    /// The registration endpoint to serve or register with
    #[clap(long)]
    socket: String,
    /// In workload mode, segfault after this many milliseconds instead of
    /// idling forever
    #[clap(long)]
    crash_after_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        #[allow(clippy::exit)]
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    if cmd.server {
        run_server(&cmd.socket)
    } else {
        run_workload(&cmd.socket, cmd.crash_after_ms)
    }
}

struct Driver;

impl crash_warden::ServerHandler for Driver {
    fn capture_dump(&self, client: &crash_warden::ClientInfo<'_>) -> Result<(), std::io::Error> {
        let (block, bytes) = warden_test::read_fault_block(client)?;

        let artifact = std::env::temp_dir().join(format!("{}.fault", uuid::Uuid::new_v4()));
        std::fs::write(&artifact, bytes)?;

        println!(
            "pid {} faulted: signal {} (code {}) at {:#x}, wrote {}",
            block.process_id,
            block.signal,
            block.code,
            block.fault_address,
            artifact.display()
        );

        Ok(())
    }

    fn on_client_registered(&self, num_clients: usize) -> crash_warden::LoopAction {
        println!("client registered, {num_clients} live");
        crash_warden::LoopAction::Continue
    }

    fn on_client_unregistered(&self, num_clients: usize) -> crash_warden::LoopAction {
        println!("client gone, {num_clients} live");

        // serve until the last monitored process has left
        if num_clients == 0 {
            crash_warden::LoopAction::Exit
        } else {
            crash_warden::LoopAction::Continue
        }
    }
}

fn run_server(socket: &str) -> anyhow::Result<()> {
    let mut server = crash_warden::Server::with_name(socket)?;
    println!("supervising on {socket}, pid {}", std::process::id());

    let shutdown = std::sync::atomic::AtomicBool::new(false);
    server.run(Box::new(Driver), &shutdown)?;

    Ok(())
}

fn run_workload(socket: &str, crash_after_ms: Option<u64>) -> anyhow::Result<()> {
    println!("pid: {}", std::process::id());

    let client = crash_warden::Client::register(socket, crash_warden::ClientOptions::default());

    match client.wait_for_registration(std::time::Duration::from_secs(10)) {
        crash_warden::MonitorStatus::Monitored => println!("monitored"),
        status => {
            anyhow::bail!("registration settled at {status:?}: {:?}", client.last_error());
        }
    }

    if let Some(ms) = crash_after_ms {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        warden_test::raise_segfault();
    }

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
