use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::StatusCode;

use jobforge_config::{Config, ConfigError};
use jobforge_core::{JobSpec, RetryPolicy, ValidationResult};
use jobforge_queue::{InMemoryQueue, JobHandler, QueueClient, handler_fn};
use jobforge_worker::{JobCatalog, Worker, WorkerError};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(queue: Arc<InMemoryQueue>) -> Self {
        // Same router as the worker binary, on an ephemeral port.
        let app = jobforge_worker::stats::router(queue);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn stats_eventually(
    client: &reqwest::Client,
    base_url: &str,
    queue: &str,
    succeeded: u64,
) -> serde_json::Value {
    // Delivery is asynchronous; poll until the counter catches up.
    for _ in 0..100 {
        let res = client
            .get(format!("{}/stats", base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if body[queue]["succeeded"].as_u64() == Some(succeeded) {
            return body;
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("queue `{}` never reached {} successful deliveries", queue, succeeded);
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn(Arc::new(InMemoryQueue::default())).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn stats_report_deliveries_per_queue() {
    let queue = Arc::new(InMemoryQueue::default());
    queue
        .register("echo", 2, Arc::new(handler_fn(|_m| async { Ok(()) })))
        .unwrap();
    queue.start();
    let srv = TestServer::spawn(queue.clone()).await;

    for _ in 0..3 {
        queue
            .enqueue("echo", b"ping".to_vec(), &RetryPolicy::default())
            .await
            .unwrap();
    }

    let client = reqwest::Client::new();
    let body = stats_eventually(&client, &srv.base_url, "echo", 3).await;

    assert_eq!(body["echo"]["enqueued"], 3);
    assert_eq!(body["echo"]["failed"], 0);
    assert_eq!(body["echo"]["in_flight"], 0);

    queue.shutdown().await;
}

fn counting_job(
    count: Arc<AtomicUsize>,
) -> impl Fn(&JobSpec) -> ValidationResult<Arc<dyn JobHandler>> {
    move |spec: &JobSpec| {
        spec.required_metadata("target")?;
        let count = count.clone();
        let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |_m| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        Ok(handler)
    }
}

const WORKER_CONFIG: &str = r#"
app:
  stack: test
worker:
  backend: memory
  retry: { enabled: true, maxDelay: 1, minDelay: 0, retryMax: 1, exp: 0, maxRand: 0 }
  jobs:
    counter:
      enabled: true
      concurrency: 2
      period: 0s
      metadata: { target: anything }
"#;

#[tokio::test]
async fn worker_runs_configured_jobs_until_shutdown() {
    let count = Arc::new(AtomicUsize::new(0));
    let catalog = JobCatalog::new().with_job("counter", counting_job(count.clone()));
    let config = Config::from_yaml_str(WORKER_CONFIG).unwrap();

    let worker = Worker::build(config, &catalog).unwrap();
    assert_eq!(worker.job_names(), vec!["counter"]);

    for _ in 0..200 {
        if count.load(Ordering::SeqCst) >= 5 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(count.load(Ordering::SeqCst) >= 5);

    worker.shutdown().await;
    let after = count.load(Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn unknown_job_aborts_startup() {
    let config = Config::from_yaml_str(WORKER_CONFIG).unwrap();

    let err = Worker::build(config, &JobCatalog::new()).unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Config(ConfigError::UnknownJob(ref name)) if name == "counter"
    ));
}

#[tokio::test]
async fn missing_metadata_aborts_startup() {
    let raw = WORKER_CONFIG.replace("metadata: { target: anything }", "metadata: {}");
    let config = Config::from_yaml_str(&raw).unwrap();
    let catalog =
        JobCatalog::new().with_job("counter", counting_job(Arc::new(AtomicUsize::new(0))));

    let err = Worker::build(config, &catalog).unwrap_err();

    assert!(matches!(err, WorkerError::Scheduler(_)));
}
