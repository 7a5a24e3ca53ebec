//! Echo server and client over BlueRPC.
//!
//! # Usage
//!
//! ```bash
//! bluerpc-echo serve --addr 127.0.0.1:9000
//! bluerpc-echo call --url ws://127.0.0.1:9000 hello
//! bluerpc-echo upload --url ws://127.0.0.1:9000 --mib 32
//! ```

use std::process::ExitCode;
use std::time::Instant;

use bluerpc::{
    Client, ConnectionConfig, ErrorValue, KnownError, MethodContext, Methods, Value, WsConnector,
    stream,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bluerpc-echo")]
#[command(about = "Echo server and client over BlueRPC")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `echo` and `count` until interrupted.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: String,
    },
    /// Call `echo` once and print the answer.
    Call {
        #[arg(long, default_value = "ws://127.0.0.1:9000")]
        url: String,
        text: String,
    },
    /// Stream zeroes to `count` and report the throughput.
    Upload {
        #[arg(long, default_value = "ws://127.0.0.1:9000")]
        url: String,
        #[arg(long, default_value_t = 16)]
        mib: usize,
    },
}

async fn echo(param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    Ok(param)
}

/// Count the bytes of an uploaded octet stream.
async fn count(param: Value, cx: MethodContext) -> Result<Value, ErrorValue> {
    let mut reader = param
        .as_stream()
        .and_then(|stream| stream.reader())
        .ok_or_else(|| KnownError::new("count expects an unread stream"))?;
    let mut total: i64 = 0;
    while let Some(chunk) = reader.next().await {
        if cx.is_cancelled() {
            break;
        }
        if let stream::Chunk::Octets(bytes) = chunk? {
            total += bytes.len() as i64;
        }
    }
    Ok(Value::from(total))
}

async fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve { addr } => {
            let methods = Methods::new().method("echo", echo).method("count", count);
            bluerpc::listen(addr, methods, ConnectionConfig::server()).await?;
        }
        Command::Call { url, text } => {
            let client = Client::new(WsConnector::new(url));
            let answer = client.invoke("echo", Value::from(text)).await?;
            println!("{}", answer.as_str().unwrap_or_default());
        }
        Command::Upload { url, mib } => {
            let client = Client::new(WsConnector::new(url));
            let (writer, handle) = stream::octets();
            let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
            tokio::spawn(async move {
                for _ in 0..mib {
                    if writer.write(chunk.clone()).await.is_err() {
                        return;
                    }
                }
                writer.finish();
            });

            let started = Instant::now();
            let total = client.invoke("count", Value::from(handle)).await?;
            let elapsed = started.elapsed();
            let bytes = total.as_int().unwrap_or_default();
            info!(bytes, ?elapsed, "upload finished");
            println!(
                "{bytes} bytes in {elapsed:.2?} ({:.1} MiB/s)",
                bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,bluerpc_session=debug".into()),
        )
        .init();

    let args = Args::parse();
    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "bluerpc-echo failed");
            ExitCode::FAILURE
        }
    }
}
