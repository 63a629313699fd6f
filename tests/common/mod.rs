#![allow(dead_code)]

use std::{
    collections::HashMap,
    ops::Deref,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use futures_util::future::BoxFuture;
use sluice::{
    batch::BatchCoordinator,
    dlq::DlqRouter,
    error::{Error, Stage},
    extract::{Extracted, FileProcessor},
    index::SearchIndex,
    message::{Document, Message},
    pipeline::MessageProcessor,
    queue::{memory::MemoryQueue, Queue},
    resources::{PurgeStats, ResourceMonitor, ResourceSnapshot, Thresholds},
    retry::RetryPolicy,
    storage::{Storage, UploadSource},
    worker::WorkerLoop,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "docs";
pub const DLQ: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/ingest-dlq";
pub const VISIBILITY: Duration = Duration::from_secs(300);

pub fn body(key: &str) -> String {
    format!(r#"{{"bucket": "{BUCKET}", "key": "{key}"}}"#)
}

/// In-memory object store. Every object is readable; missing keys are `NotFound`.
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<(String, String), Bytes>>,
}

impl FakeStorage {
    pub fn put(&self, key: &str, contents: &str) {
        self.objects.lock().unwrap().insert(
            (BUCKET.to_owned(), key.to_owned()),
            Bytes::from(contents.to_owned()),
        );
    }
}

impl Storage for FakeStorage {
    fn download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local_path: &'a Path,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let object = self
                .objects
                .lock()
                .unwrap()
                .get(&(bucket.to_owned(), key.to_owned()))
                .cloned()
                .ok_or_else(|| Error::not_found(format!("object {bucket}/{key}")))?;
            tokio::fs::write(local_path, &object).await?;
            Ok(())
        })
    }

    fn upload<'a>(
        &'a self,
        source: UploadSource,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let bytes = match source {
                UploadSource::Bytes(bytes) => bytes,
                UploadSource::Path(path) => Bytes::from(tokio::fs::read(path).await?),
            };
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_owned(), key.to_owned()), bytes);
            Ok(())
        })
    }
}

/// What the scripted processor does when it sees a given file content.
#[derive(Clone)]
pub enum Script {
    Fail(fn() -> Error),
    Panic,
    /// Succeed after sleeping.
    Sleep(Duration),
}

/// Extracts file contents as text unless the content is scripted.
#[derive(Default)]
pub struct ScriptedProcessor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn on(self, contents: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(contents.to_owned(), script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FileProcessor for ScriptedProcessor {
    fn supports(&self, key: &str) -> bool {
        !key.ends_with(".exe")
    }

    fn process<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, Result<Extracted, Error>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = tokio::fs::read_to_string(local_path).await?;

            let script = self.scripts.lock().unwrap().get(&text).cloned();
            match script {
                Some(Script::Fail(make)) => Err(make()),
                Some(Script::Panic) => panic!("processor crashed on {text:?}"),
                Some(Script::Sleep(duration)) => {
                    tokio::time::sleep(duration).await;
                    Ok(Extracted {
                        text,
                        ..Default::default()
                    })
                }
                None => Ok(Extracted {
                    text,
                    ..Default::default()
                }),
            }
        })
    }
}

/// Records indexed documents; documents whose text is listed in `stall` time out.
#[derive(Default)]
pub struct FakeIndex {
    indexed: Mutex<Vec<String>>,
    stall: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeIndex {
    pub fn stall_on(self, text: &str) -> Self {
        self.stall.lock().unwrap().push(text.to_owned());
        self
    }

    pub fn indexed(&self) -> Vec<String> {
        self.indexed.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SearchIndex for FakeIndex {
    fn index_one<'a>(
        &'a self,
        document: &'a Document,
        id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall.lock().unwrap().contains(&document.text) {
                return Err(Error::timeout(Stage::Index, Duration::from_secs(30)));
            }
            self.indexed.lock().unwrap().push(id.to_owned());
            Ok(true)
        })
    }

    fn bulk_index<'a>(
        &'a self,
        documents: &'a [Document],
    ) -> BoxFuture<'a, Result<(usize, Vec<Error>), Error>> {
        Box::pin(async move {
            for document in documents {
                self.index_one(document, &document.id).await?;
            }
            Ok((documents.len(), Vec::new()))
        })
    }
}

/// Monitor that replays scripted memory readings, repeating the last one.
pub struct FakeMonitor {
    readings: Mutex<Vec<f64>>,
    samples: AtomicUsize,
    mitigations: AtomicUsize,
    housekeeping: AtomicUsize,
}

impl FakeMonitor {
    pub fn healthy() -> Self {
        Self::with_memory(&[40.0])
    }

    pub fn with_memory(readings: &[f64]) -> Self {
        let mut readings = readings.to_vec();
        readings.reverse();
        Self {
            readings: Mutex::new(readings),
            samples: AtomicUsize::new(0),
            mitigations: AtomicUsize::new(0),
            housekeeping: AtomicUsize::new(0),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn mitigations(&self) -> usize {
        self.mitigations.load(Ordering::SeqCst)
    }

    pub fn housekeeping_runs(&self) -> usize {
        self.housekeeping.load(Ordering::SeqCst)
    }
}

impl ResourceMonitor for FakeMonitor {
    fn sample(&self) -> ResourceSnapshot {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let mut readings = self.readings.lock().unwrap();
        let memory_percent = if readings.len() > 1 {
            readings.pop().unwrap()
        } else {
            readings[0]
        };

        ResourceSnapshot {
            memory_percent,
            cpu_percent: 5.0,
            free_disk_bytes: u64::MAX,
            taken_at: Utc::now(),
        }
    }

    fn mitigate(&self) -> BoxFuture<'_, PurgeStats> {
        self.mitigations.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { PurgeStats::default() })
    }

    fn housekeeping(&self) -> BoxFuture<'_, PurgeStats> {
        self.housekeeping.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { PurgeStats::default() })
    }
}

/// A coordinator wired to in-memory collaborators.
pub struct Harness {
    pub coordinator: BatchCoordinator<MemoryQueue>,
    pub queue: MemoryQueue,
    pub storage: Arc<FakeStorage>,
    pub processor: Arc<ScriptedProcessor>,
    pub index: Arc<FakeIndex>,
    pub shutdown: CancellationToken,
    pub tmpdir: TempDir,
}

impl Deref for Harness {
    type Target = BatchCoordinator<MemoryQueue>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(5))
        .inline_retries(2)
        .attempt_budget(3)
        .build()
}

pub fn setup(processor: ScriptedProcessor, index: FakeIndex) -> Harness {
    let tmpdir = tempfile::tempdir().unwrap();
    let queue = MemoryQueue::new();
    let shared = Arc::new(queue.clone());
    let storage = Arc::new(FakeStorage::default());
    let processor = Arc::new(processor);
    let index = Arc::new(index);
    let shutdown = CancellationToken::new();

    let pipeline = MessageProcessor::builder()
        .storage(storage.clone())
        .processor(processor.clone())
        .index(index.clone())
        .retry(retry_policy())
        .temp_dir(tmpdir.path().join("tmp"))
        .shutdown(shutdown.clone())
        .build();

    let coordinator = BatchCoordinator::builder()
        .queue(shared.clone())
        .processor(Arc::new(pipeline))
        .dlq(
            DlqRouter::builder()
                .queue(shared)
                .destination(DLQ)
                .worker_id("test-worker")
                .build(),
        )
        .max_workers(4)
        .shutdown(shutdown.clone())
        .build();

    Harness {
        coordinator,
        queue,
        storage,
        processor,
        index,
        shutdown,
        tmpdir,
    }
}

impl Harness {
    /// Store `contents` under `key` and enqueue a message pointing at it.
    pub fn enqueue(&self, key: &str, contents: &str) -> String {
        self.storage.put(key, contents);
        self.queue.push(body(key))
    }

    pub async fn receive(&self) -> Vec<Message> {
        self.queue
            .receive(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
    }
}

/// Harness parts that remain once the coordinator moves into a worker loop.
pub struct WorkerHarness {
    pub queue: MemoryQueue,
    pub storage: Arc<FakeStorage>,
    pub processor: Arc<ScriptedProcessor>,
    pub index: Arc<FakeIndex>,
    pub shutdown: CancellationToken,
    pub tmpdir: TempDir,
}

impl WorkerHarness {
    pub fn enqueue(&self, key: &str, contents: &str) -> String {
        self.storage.put(key, contents);
        self.queue.push(body(key))
    }
}

/// Wrap the harness coordinator in a worker loop polling the harness queue.
pub fn worker(harness: Harness, monitor: Arc<FakeMonitor>) -> (WorkerLoop<MemoryQueue>, WorkerHarness) {
    let Harness {
        coordinator,
        queue,
        storage,
        processor,
        index,
        shutdown,
        tmpdir,
    } = harness;

    let worker = WorkerLoop::builder()
        .queue(Arc::new(queue.clone()))
        .coordinator(coordinator)
        .monitor(monitor)
        .thresholds(Thresholds::builder().max_memory_percent(90.0).build())
        .wait_time(Duration::from_secs(20))
        .visibility_timeout(VISIBILITY)
        .admission_backoff(Duration::from_secs(30))
        .poll_error_backoff(Duration::from_secs(5))
        .shutdown(shutdown.clone())
        .build();

    let rest = WorkerHarness {
        queue,
        storage,
        processor,
        index,
        shutdown,
        tmpdir,
    };
    (worker, rest)
}
