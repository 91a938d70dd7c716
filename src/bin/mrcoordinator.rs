use std::{env, time::Duration};

use futures::StreamExt;
use map_reduce_rs::mr::{
    coordinator::Coordinator,
    rpc::{socket_path, Master},
};
use tarpc::{server::incoming::Incoming, tokio_serde::formats::Json};
use tokio::{net::UnixListener, time::sleep};

/// The implicit reduce fan-out when none is configured by the launcher
/// (spec.md §6: "a *master* taking one or more input filenames and an
/// implicit R=10").
const DEFAULT_REDUCE_N: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        println!("Usage: cargo run --bin mrcoordinator -- <input file> [<input file> ...]");
        return Ok(());
    }

    let input_files = args[1..].to_vec();

    println!(
        "[Coordinator Configuration] #{} Map Tasks | #{} Reduce Tasks",
        input_files.len(),
        DEFAULT_REDUCE_N
    );

    let coordinator = Coordinator::new(input_files, DEFAULT_REDUCE_N);

    let sock_path = socket_path();
    // A stale socket file left behind by a previous, uncleanly-terminated
    // run would otherwise make bind fail.
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)
        .map_err(|e| anyhow::anyhow!("listen failed on {sock_path}: {e}"))?;

    println!("[Preparation] The Coordinator RPC server has launched on {sock_path}, please launch worker process(es) to begin MapReduce");

    let incoming_transports = futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(stream, _addr)| stream);
        Some((accepted, listener))
    })
    .filter_map(|r| async { r.ok() })
    .map(|stream| tarpc::serde_transport::new(stream, Json::default()));

    let coordinator_for_server = coordinator.clone();
    tokio::spawn(
        incoming_transports
            .map(tarpc::server::BaseChannel::with_defaults)
            .execute(coordinator_for_server.serve()),
    );

    while !coordinator.done() {
        sleep(Duration::from_secs(1)).await;
    }

    println!(
        "\nThe MapReduce job has finished, please check the results at `mr-out-*`\n{}",
        "Intermediate `mr-*-*` files have already been consumed by the reducers that produced them."
    );

    let _ = std::fs::remove_file(&sock_path);
    Ok(())
}
