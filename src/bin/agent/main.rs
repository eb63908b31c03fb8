use clap::Parser;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use axis::{error::Error, key::Key, master_client, settings::Settings};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML file containing the program settings
    #[arg(short, long)]
    settings: String,
}

const MSG_SIGNAL: &'static str = "signal";

fn main() -> Result<(), Error> {
    let args: Args = Args::parse();
    let settings = Settings::load(&args.settings)?;
    settings.setup_logging("agent")?;

    let key = Key::load_or_create(&settings.agent.key_file)?;
    log::info!(
        "Agent {} starting, key {}",
        settings.agent.id,
        key.fingerprint()
    );

    // async is annoying when you don't need it...
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::from(format!("Could not unwrap tokio runtime: {e}")))?;

    // Functionality for interrupting on received signals
    let (msg_send, msg_recv) = std::sync::mpsc::channel();
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let sigc_handle = std::thread::spawn(move || {
        for sig in signals.forever() {
            log::info!("Received signal {sig}");
            msg_send
                .send(MSG_SIGNAL)
                .unwrap_or_else(|e| log::error!("Could not send notification message: {e}"));
            break;
        }
    });

    let init_time = Instant::now();
    let interval = Duration::from_secs(settings.agent.poll_interval_seconds.into());
    let mut next_offset = Duration::ZERO;
    let mut registered = false;

    let mut active = true;
    while active {
        next_offset += interval;

        if !registered {
            // Registering again also tells the master that anything
            // dispatched to a previous process is lost.
            match rt.block_on(master_client::register(&settings, &key)) {
                Ok(ack) => {
                    log::info!("Registered with master: {} {}", ack.code, ack.message);
                    registered = true;
                }
                Err(e) => log::warn!("Could not register with master: {e}"),
            }
        }

        if registered {
            match rt.block_on(master_client::poll(&settings, &key)) {
                Ok(Some(task)) => {
                    log::info!("Received task\n{task}");
                    let report = task.execute_all(&settings.shell);
                    log::info!(
                        "Task {} {}",
                        task.id,
                        if report.success { "succeeded" } else { "failed" }
                    );
                    rt.block_on(master_client::report(&settings, &key, task.id, &report))
                        .map(|ack| log::debug!("Report acknowledged: {}", ack.message))
                        .unwrap_or_else(|e| log::error!("Could not report task {}: {e}", task.id));

                    // More tasks may be waiting, do not sleep.
                    next_offset = init_time.elapsed();
                }
                // Nothing queued, or not accepted yet
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Error polling the master: {e}");
                    // The master may have lost track of us, e.g. after the
                    // operator deleted the agent.
                    registered = false;
                }
            }
        }

        let sleep_time = next_offset
            .checked_sub(init_time.elapsed())
            .unwrap_or(Duration::ZERO);
        match msg_recv.recv_timeout(sleep_time) {
            Ok(_) => {
                // Received a message on the signal channel, no longer running
                active = false;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {} // timeout, expected
            Err(e) => {
                log::warn!("Received unexpected channel error: {e}")
            }
        }
        if active && sigc_handle.is_finished() {
            log::error!("Signal handler finished unexpectedly.");
            active = false;
        }
    }

    log::info!("Agent {} exiting", settings.agent.id);
    Ok(())
}
