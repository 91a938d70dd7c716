use std::{env, time::Duration};

use map_reduce_rs::mr::{
    function::wc,
    rpc::{socket_path, GetTaskReply, MasterClient, Op},
    worker::Worker,
};
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::{net::UnixStream, time::sleep};

/// Repeatedly request a task, execute it within the lease window, and
/// report completion. Stateless other than the cached worker id
/// (spec.md §4.2).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let sock_path = socket_path();

    let client_transport = match UnixStream::connect(&sock_path).await {
        Ok(stream) => tarpc::serde_transport::new(stream, Json::default()),
        Err(e) => {
            println!(
                "[Preparation] Worker failed to connect to the Coordinator at {sock_path}, please check it is running!\nError: {e}"
            );
            return Ok(());
        }
    };

    let client = MasterClient::new(client::Config::default(), client_transport).spawn();

    let worker_id = client.register(context::current()).await?;
    println!("[Preparation] registered as worker #{worker_id}");

    let worker = Worker::new(worker_id, env::current_dir()?, wc::map, wc::reduce);

    loop {
        let reply = client.get_task(context::current(), worker_id).await?;
        match reply {
            GetTaskReply::Map {
                task_id,
                filename,
                buckets,
                lease_expiry,
            } => {
                let worker = worker.clone();
                let handle =
                    tokio::task::spawn_blocking(move || worker.do_map(task_id, &filename, buckets));
                if race_against_lease(handle, lease_expiry).await {
                    report_done(&client, worker_id, task_id, Op::Map).await;
                } else {
                    println!("[Map] task #{task_id} abandoned: lease expired");
                }
            }
            GetTaskReply::Reduce {
                task_id,
                lease_expiry,
            } => {
                let worker = worker.clone();
                let handle = tokio::task::spawn_blocking(move || worker.do_reduce(task_id));
                if race_against_lease(handle, lease_expiry).await {
                    report_done(&client, worker_id, task_id, Op::Reduce).await;
                } else {
                    println!("[Reduce] task #{task_id} abandoned: lease expired");
                }
            }
            GetTaskReply::Wait => {
                sleep(Duration::from_secs(1)).await;
            }
            GetTaskReply::Shutdown => {
                println!("[Shutdown] no more work, worker #{worker_id} terminating");
                return Ok(());
            }
        }
    }
}

/// Run the in-flight user work against a lease-deadline timer. Returns
/// `true` if the work finished successfully before the deadline — the
/// worker never kills the blocking task, it simply stops waiting on it
/// (spec.md §5: "no kill signal is delivered").
async fn race_against_lease(
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    lease_expiry: std::time::SystemTime,
) -> bool {
    let deadline = lease_expiry
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);

    tokio::select! {
        result = handle => {
            match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    println!("[Worker] user function / intermediate I/O failed: {e}");
                    false
                }
                Err(e) => {
                    println!("[Worker] user function task panicked: {e}");
                    false
                }
            }
        }
        _ = sleep(deadline) => false,
    }
}

async fn report_done(client: &MasterClient, worker_id: u64, task_id: u64, op: Op) {
    match client.task_done(context::current(), worker_id, task_id, op).await {
        Ok(Ok(())) => {}
        Ok(Err(task_err)) => {
            println!("[{op:?}] completion for task #{task_id} rejected by coordinator: {task_err}")
        }
        Err(rpc_err) => {
            println!("[{op:?}] reporting task #{task_id} done failed (rpc, non-fatal): {rpc_err}")
        }
    }
}
