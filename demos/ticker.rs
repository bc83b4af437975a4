use daemon_context::{DaemonContext, DaemonError, PidFile};
use std::env;
use std::fs::OpenOptions;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pwd = env::current_dir()?;
    let log_path = pwd.join("ticker.log");
    let err_path = pwd.join("ticker.err");
    let pid_path = pwd.join("ticker.pid");

    // Append mode so restarts don't truncate earlier runs.
    let stdout_file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let stderr_file = OpenOptions::new().create(true).append(true).open(&err_path)?;

    println!("Launching a simple ticker daemon...");
    println!("Logs will be written to: {:?}", log_path);

    let context = DaemonContext::new()
        .working_directory(&pwd)
        .umask(0o027)
        .stdout(stdout_file)
        .stderr(stderr_file)
        .pidfile(PidFile::new(&pid_path))
        .notify_ready(true)
        .build()?;

    match context.open() {
        Ok(()) => {}
        Err(DaemonError::TargetLocked { path }) => {
            eprintln!("Daemon is already running ({})", path.display());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    // stderr now points at ticker.err
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tracing::info!(pid = std::process::id(), "ticker started");

    // SIGTERM ends the process through the default signal map, which also
    // releases the PID file.
    let mut i: u64 = 0;
    loop {
        println!("[Ticker] Ping #{i}");
        i += 1;
        thread::sleep(Duration::from_secs(3));
    }
}
