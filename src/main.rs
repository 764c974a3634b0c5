use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use printlink::{
    host_config, init_logging, list_ports, Config, ConnectOptions, JobStatus, PrinterHost,
    StreamOptions,
};
use printlink_core::LogDirection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "printlink", version = printlink::VERSION, about = "Serial host for Marlin 3D printers")]
struct Cli {
    /// Config file (TOML or JSON); defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports that look like printers
    Ports,
    /// Connect and send commands one at a time
    Send {
        #[command(flatten)]
        link: LinkArgs,
        /// Commands, e.g. "M105" "G28"
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Stream a G-code file; Ctrl-C triggers an emergency stop
    Print {
        #[command(flatten)]
        link: LinkArgs,
        file: PathBuf,
    },
}

#[derive(Args)]
struct LinkArgs {
    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(long)]
    port: Option<String>,

    /// Fixed baud rate
    #[arg(long, conflicts_with = "auto")]
    baud: Option<u32>,

    /// Probe the configured baud candidates
    #[arg(long)]
    auto: bool,
}

impl LinkArgs {
    fn options(&self) -> ConnectOptions {
        let mut options = ConnectOptions {
            port: self.port.clone(),
            ..ConnectOptions::default()
        };
        if let Some(baud) = self.baud {
            options = options.with_baud_rate(baud).with_auto_detect(false);
        } else if self.auto {
            options = options.with_auto_detect(true);
        }
        options
    }
}

async fn connect(config: &Config, link: &LinkArgs) -> anyhow::Result<PrinterHost> {
    if link.port.is_none() && config.connection.port.is_empty() {
        bail!("no port given; pass --port or set connection.port in the config file");
    }

    let host = PrinterHost::new(host_config(config));
    let info = host
        .connect(link.options())
        .await
        .context("failed to connect to printer")?;

    let firmware = info
        .firmware
        .as_ref()
        .and_then(|f| f.firmware_name.clone())
        .unwrap_or_else(|| "unknown firmware".to_string());
    println!("Connected to {} @ {} baud ({})", info.port, info.baud_rate, firmware);
    Ok(host)
}

fn ports() -> anyhow::Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.manufacturer {
            Some(manufacturer) => {
                println!("{}\t{} ({})", port.port_name, port.description, manufacturer)
            }
            None => println!("{}\t{}", port.port_name, port.description),
        }
    }
    Ok(())
}

async fn send(config: &Config, link: &LinkArgs, commands: &[String]) -> anyhow::Result<()> {
    let host = connect(config, link).await?;
    let journal = host.journal().clone();

    let mut result = Ok(());
    for command in commands {
        let mark = journal.entries().last().map_or(0, |e| e.seq + 1);
        match host.send_command(command).await {
            Ok(_) => {
                for entry in journal.since(mark) {
                    if entry.direction == LogDirection::Rx {
                        println!("{}", entry.text);
                    }
                }
            }
            Err(e) => {
                result = Err(e).with_context(|| format!("command `{}` failed", command));
                break;
            }
        }
    }

    host.disconnect(false).await;
    result
}

async fn print(config: &Config, link: &LinkArgs, file: &Path) -> anyhow::Result<()> {
    let program = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let host = connect(config, link).await?;

    let reported = Arc::new(AtomicU64::new(u64::MAX));
    let options = StreamOptions::default().on_progress(move |sent, total| {
        let percent = (sent * 100 / total.max(1)) as u64;
        if reported.swap(percent, Ordering::Relaxed) != percent {
            println!("{:>3}% ({}/{})", percent, sent, total);
        }
    });

    let job = host.start_job(&program, options).await?;
    let wait = job.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping the printer");
            host.emergency_stop("interrupted from the command line").await?;
            wait.await
        }
    };

    let snapshot = host.job();
    host.disconnect(false).await;

    let summary = outcome?;
    match snapshot.status {
        JobStatus::Completed => println!("Done: {} lines sent", summary.sent),
        status => println!("{}: {} of {} lines sent", status, summary.sent, summary.total),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let config = Config::load_or_default(cli.config.as_deref())?;
    tracing::debug!("printlink {} built {}", printlink::VERSION, printlink::BUILD_DATE);

    match &cli.command {
        Command::Ports => ports(),
        Command::Send { link, commands } => send(&config, link, commands).await,
        Command::Print { link, file } => print(&config, link, file).await,
    }
}
