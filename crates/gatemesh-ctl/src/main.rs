//! gatemesh-ctl: command-line interface for the gatemesh daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 8080;

fn print_usage() {
    println!("gatemesh-ctl [--host HOST] [--port PORT] <command>");
    println!();
    println!("Commands:");
    println!("  status             Node identity, peer counts and local score");
    println!("  peers              Peer directory");
    println!("  peers drop <id>    Remove a peer from the directory");
    println!("  metrics            Local and peer load metrics");
    println!("  scores             Scores of local node and Connected peers");
    println!("  select             Best peer and current routing decision");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut host = "127.0.0.1".to_string();
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--host" => {
                i += 1;
                host = args.get(i).context("--host requires a value")?.clone();
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(&host, port).await,
        ["peers"] => cmd::peers::cmd_peers(&host, port).await,
        ["peers", "drop", id] => cmd::peers::cmd_peer_drop(&host, port, id).await,
        ["metrics"] => cmd::status::cmd_metrics(&host, port).await,
        ["scores"] => cmd::peers::cmd_scores(&host, port).await,
        ["select"] => cmd::peers::cmd_select(&host, port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
