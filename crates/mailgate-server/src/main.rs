//! MailGate - Anti-abuse decision engine entry point

mod protocol;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailgate_common::config::{Config, LoggingConfig};
use mailgate_core::Engine;
use protocol::{CheckLine, Reply};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[clap(version, about, long_about = None)]
#[clap(name = "mailgate")]
struct Cli {
    /// Configuration file, defaults to ./mailgate.toml or /etc/mailgate/mailgate.toml
    #[clap(short, long, env = "MAILGATE_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read check requests from stdin and write results to stdout (default)
    Serve {
        /// Print the metrics exposition to stderr on shutdown
        #[clap(long)]
        metrics_on_exit: bool,
    },
    /// Validate the configuration and exit
    CheckConfig,
    /// Print the DKIM TXT record for the configured signing key
    DkimRecord,
    /// Sign a raw message with the configured key and print the DKIM-Signature header
    Sign {
        /// Message file, or '-' for stdin
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    init_logging(&config.logging);

    match cli.command.unwrap_or(Commands::Serve {
        metrics_on_exit: false,
    }) {
        Commands::Serve { metrics_on_exit } => serve(config, metrics_on_exit).await,
        Commands::CheckConfig => {
            Engine::builder(config).build()?;
            println!("Configuration OK");
            Ok(())
        }
        Commands::DkimRecord => {
            let engine = Engine::builder(config).build()?;
            let signer = engine
                .signer()
                .context("No [dkim_signing] section configured")?;
            println!(
                "{}._domainkey.{} IN TXT \"{}\"",
                signer.selector(),
                signer.domain(),
                signer.public_key_record()
            );
            Ok(())
        }
        Commands::Sign { path } => {
            let engine = Engine::builder(config).build()?;
            let signer = engine
                .signer()
                .context("No [dkim_signing] section configured")?;
            let message = if path.as_os_str() == "-" {
                let mut buf = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut tokio::io::stdin(), &mut buf).await?;
                buf
            } else {
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?
            };
            println!("DKIM-Signature: {}", signer.sign_message(&message));
            Ok(())
        }
    }
}

async fn serve(config: Config, metrics_on_exit: bool) -> Result<()> {
    info!("Starting MailGate decision engine...");

    let sweep_interval = Duration::from_secs(config.greylist.sweep_interval_secs.max(1));
    let engine = Arc::new(Engine::builder(config).build()?);
    let shutdown = CancellationToken::new();

    // Periodic pruning of expired greylist tuples and idle rate buckets
    let greylist_sweeper = engine
        .greylist()
        .clone()
        .spawn_sweeper(sweep_interval, shutdown.clone());
    let bucket_sweeper = {
        let limiter = engine.rate_limiter().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.prune_at(tokio::time::Instant::now());
                        if removed > 0 {
                            debug!("Pruned {} idle rate buckets", removed);
                        }
                    }
                }
            }
        })
    };

    info!("MailGate ready, reading requests from stdin");

    let handler = {
        let engine = engine.clone();
        move |line: String| {
            let engine = engine.clone();
            async move { handle_line(&engine, &line).await }
        }
    };
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        result = pipeline(tokio::io::stdin(), tokio::io::stdout(), MAX_IN_FLIGHT, handler) => {
            result
        }
    };

    shutdown.cancel();
    let _ = greylist_sweeper.await;
    let _ = bucket_sweeper.await;

    if metrics_on_exit {
        eprint!("{}", engine.metrics().export());
    }

    info!("MailGate shutdown complete");

    result
}

/// Checks evaluated concurrently before the reader waits for the writer
const MAX_IN_FLIGHT: usize = 64;

/// Runs each input line as its own task and writes replies in input order
async fn pipeline<R, W, F, Fut>(
    reader: R,
    mut writer: W,
    max_in_flight: usize,
    handler: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<JoinHandle<Reply>>(max_in_flight.max(1));

    let writer_task = tokio::spawn(async move {
        while let Some(pending) = rx.recv().await {
            let reply = match pending.await {
                Ok(reply) => reply,
                Err(e) => Reply::error(&mailgate_common::Error::Internal(format!(
                    "Check task failed: {}",
                    e
                ))),
            };
            let mut out = reply.to_line();
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if tx.send(tokio::spawn(handler(line))).await.is_err() {
            // Writer stopped on an output error, reported below
            break;
        }
    }
    debug!("End of input");
    drop(tx);

    writer_task.await.context("Output task panicked")??;
    Ok(())
}

async fn handle_line(engine: &Engine, line: &str) -> Reply {
    let parsed = CheckLine::parse(line).and_then(|check| {
        let legacy = check.legacy;
        check.into_request().map(|req| (req, legacy))
    });

    match parsed {
        Ok((req, legacy)) => {
            let ctx = engine.new_context();
            let result = if legacy {
                engine.check_legacy(&ctx, &req).await
            } else {
                engine.check(&ctx, &req).await
            };
            Reply::Result(Box::new(result))
        }
        Err(e) => {
            warn!("Rejected input line: {}", e);
            Reply::error(&e)
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // stdout carries the protocol, so logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    fn echo_after(line: String) -> impl Future<Output = Reply> + Send + 'static {
        async move {
            let delay: u64 = line.trim_start_matches("slow").parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_secs(delay)).await;
            Reply::Error {
                error: line,
                code: "ECHO",
            }
        }
    }

    async fn run(input: &'static str, max_in_flight: usize) -> Vec<String> {
        let (writer, mut output) = tokio::io::duplex(4096);
        pipeline(input.as_bytes(), writer, max_in_flight, echo_after)
            .await
            .unwrap();
        let mut text = String::new();
        output.read_to_string(&mut text).await.unwrap();
        text.lines().map(str::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_does_not_stall_later_lines() {
        let start = Instant::now();
        let lines = run("slow30\nslow10\n\nslow0\n", 8).await;

        // Checks overlap, so the run takes about as long as the slowest one
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(40));
        assert_eq!(
            lines,
            vec![
                r#"{"error":"slow30","code":"ECHO"}"#,
                r#"{"error":"slow10","code":"ECHO"}"#,
                r#"{"error":"slow0","code":"ECHO"}"#,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_limit_keeps_order() {
        let start = Instant::now();
        let lines = run("slow5\nslow5\nslow5\nslow5\n", 1).await;

        assert!(start.elapsed() < Duration::from_secs(20));
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.contains("slow5")));
    }
}
