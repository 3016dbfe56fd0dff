//! percyd CLI: start / stop / status for the snapshot daemon.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use percyd::{logging, Config, PercyDaemon};

#[derive(Parser)]
#[command(name = "percyd")]
#[command(about = "Visual-snapshot asset-discovery daemon via Chrome DevTools Protocol")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Control-server port
        #[arg(short, long, default_value_t = percyd::config::DEFAULT_PORT)]
        port: u16,

        /// Run in foreground
        #[arg(short, long)]
        foreground: bool,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info", env = "PERCY_LOGLEVEL")]
        loglevel: String,

        /// Disable the local control server
        #[arg(long)]
        no_server: bool,

        /// Hostname glob captured in addition to each snapshot's origin
        #[arg(long = "allowed-hostname")]
        allowed_hostnames: Vec<String>,

        /// Hostname glob whose requests are aborted (analytics blockers)
        #[arg(long = "disallowed-hostname")]
        disallowed_hostnames: Vec<String>,
    },

    /// Stop a running daemon
    Stop {
        #[arg(short, long, default_value_t = percyd::config::DEFAULT_PORT)]
        port: u16,
    },

    /// Check daemon status
    Status {
        #[arg(short, long, default_value_t = percyd::config::DEFAULT_PORT)]
        port: u16,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            foreground,
            loglevel,
            no_server,
            allowed_hostnames,
            disallowed_hostnames,
        } => {
            if Config::capture_disabled() {
                println!("Percy is disabled (PERCY_ENABLE=0)");
                return Ok(());
            }
            let mut config = Config::default();
            config.apply_env();
            config.port = port;
            config.server = !no_server;
            config
                .discovery
                .allowed_hostnames
                .extend(allowed_hostnames);
            config
                .discovery
                .disallowed_hostnames
                .extend(disallowed_hostnames);
            cmd_start(config, foreground, loglevel)
        }
        Commands::Stop { port } => cmd_stop(port),
        Commands::Status { port } => cmd_status(port),
    }
}

fn pid_file() -> PathBuf {
    std::env::temp_dir().join("percyd.pid")
}

fn cmd_start(config: Config, foreground: bool, loglevel: String) -> Result<()> {
    if foreground {
        return run_daemon(config, &loglevel);
    }

    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file(pid_file())
        .working_directory(std::env::temp_dir());
    match daemonize.start() {
        Ok(_) => run_daemon(config, &loglevel),
        Err(e) => {
            eprintln!("Failed to daemonize: {e}");
            std::process::exit(1);
        }
    }
}

fn run_daemon(config: Config, loglevel: &str) -> Result<()> {
    let level_handle = logging::init(loglevel);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async {
        let daemon = PercyDaemon::new(config, level_handle)?;
        let _ = daemon.set_loglevel(loglevel);
        let build = daemon.start().await?;
        tracing::info!(number = build.number, url = %build.url, "created build");

        wait_for_shutdown_signal().await;
        daemon.stop().await;
        Ok::<_, anyhow::Error>(())
    })?;

    let _ = std::fs::remove_file(pid_file());
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn cmd_stop(port: u16) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let stopped = runtime.block_on(async {
        let client = reqwest::Client::new();
        match client
            .post(format!("http://127.0.0.1:{port}/percy/stop"))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    });

    if stopped {
        let _ = std::fs::remove_file(pid_file());
        println!("Daemon stopped.");
        return Ok(());
    }

    // Control server unreachable; fall back to the pid file.
    let pid_path = pid_file();
    let pid_str = std::fs::read_to_string(&pid_path)
        .context("Failed to read PID file - daemon may not be running")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    if !pid_matches_process(pid, "percyd") {
        anyhow::bail!("Refusing to stop PID {}: unexpected process", pid);
    }

    println!("Stopping percyd (PID: {pid})...");
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(500));
    let _ = std::fs::remove_file(&pid_path);
    println!("Daemon stopped.");
    Ok(())
}

fn pid_matches_process(pid: i32, expected_name: &str) -> bool {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let command = String::from_utf8_lossy(&output.stdout);
            command.trim().contains(expected_name)
        }
        _ => false,
    }
}

fn cmd_status(port: u16) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async {
        let client = reqwest::Client::new();
        match client
            .get(format!("http://127.0.0.1:{port}/percy/healthcheck"))
            .send()
            .await
        {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                println!("Status: RUNNING");
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            Err(_) => {
                println!("Status: NOT RUNNING");
                println!("No control server on port {port}");
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}
