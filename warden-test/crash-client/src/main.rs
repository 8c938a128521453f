use clap::Parser;
use warden_test::ClientMode;

#[derive(Parser)]
struct Command {
    /// The registration endpoint of the supervisor to register with
    #[clap(long)]
    socket: String,
    /// What to do once registration has settled
    #[clap(long, value_enum)]
    mode: ClientMode,
    /// Delay between registering and acting out the mode
    #[clap(long, default_value_t = 0)]
    delay_ms: u64,
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let client = crash_warden::Client::register(
        cmd.socket.as_str(),
        crash_warden::ClientOptions::default(),
    );

    match client.wait_for_registration(std::time::Duration::from_secs(10)) {
        crash_warden::MonitorStatus::Monitored => {}
        status => {
            anyhow::bail!(
                "registration settled at {status:?}: {:?}",
                client.last_error()
            );
        }
    }

    println!("registered");

    if cmd.delay_ms > 0 {
        std::thread::sleep(std::time::Duration::from_millis(cmd.delay_ms));
    }

    match cmd.mode {
        ClientMode::Segv => {
            warden_test::raise_segfault();
            anyhow::bail!("we should have segfaulted and never gotten here");
        }
        ClientMode::CleanExit => Ok(()),
        ClientMode::Linger => loop {
            std::thread::sleep(std::time::Duration::from_secs(1));
        },
    }
}

fn main() {
    // This program is supposed to die however its mode says, so any error
    // that keeps that from happening must fail the test; exit with a code
    // that no signal death can produce
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
