use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use judged::config::{CliArgs, Config};
use judged::database as db;
use judged::judge::Judge;
use judged::queue::{JobQueue, QueueEvent};
use judged::sandbox::BoxPool;
use judged::web_server::build_server;
use judged::worker::worker;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();

    if cli.workers == 0 {
        panic!("The number of judge workers must not be 0");
    }

    let Config {
        server: server_config,
        judge: judge_config,
        queue: queue_config,
    } = cli.to_config().expect("Failed to load configuration");

    if judge_config.pool_capacity == 0 {
        panic!("The sandbox pool capacity must not be 0");
    }

    let db_path = db::get_db_path();
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = Arc::new(
        db::init_db(&db_path)
            .await
            .expect("Failed to initialize database"),
    );

    let box_pool = Arc::new(BoxPool::new(judge_config.pool_capacity));
    let judge = Arc::new(Judge::new(box_pool, judge_config));
    let job_queue = JobQueue::new(db_pool.clone(), queue_config);
    job_queue
        .recover()
        .await
        .expect("Failed to recover queued jobs");

    spawn_event_logger(&job_queue);

    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=cli.workers {
        workers.spawn(worker(
            i,
            judge.clone(),
            db_pool.clone(),
            job_queue.clone(),
            shutdown_token.clone(),
        ));
    }

    let server =
        build_server(server_config, db_pool, job_queue).expect("Failed to build server");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Mirrors queue lifecycle events into the log; progress-tracking side
/// effects hang off the same subscription in the surrounding platform.
fn spawn_event_logger(queue: &Arc<JobQueue>) {
    let mut events = queue.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Waiting { job_id, submission_id }) => {
                    log::debug!("Job {job_id} waiting (submission {submission_id})");
                }
                Ok(QueueEvent::Active { job_id, submission_id }) => {
                    log::info!("Job {job_id} active (submission {submission_id})");
                }
                Ok(QueueEvent::Completed { job_id, submission_id, verdict, duration_ms }) => {
                    log::info!(
                        "Job {job_id} completed (submission {submission_id}): {verdict} in {duration_ms}ms"
                    );
                }
                Ok(QueueEvent::Failed { job_id, submission_id, error }) => {
                    log::error!("Job {job_id} failed (submission {submission_id}): {error}");
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Event logger lagged, skipped {n} event(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
