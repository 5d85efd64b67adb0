pub mod broadcaster;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::GalleryError;
use crate::git::progress::BASELINE_PROGRESS;
use crate::model::{EventMessage, ExhibitId, ProgressEvent, ProgressUpdate};
use broadcaster::EventHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  Clone,
  Update,
}

impl SyncMode {
  /// Clone when nothing is on disk yet, update otherwise.
  pub fn for_target(target: &Path) -> Self {
    if target.exists() {
      SyncMode::Update
    } else {
      SyncMode::Clone
    }
  }
}

/// What a caller asks for; the engine turns this into a [`SyncJob`] at
/// admission time.
#[derive(Debug, Clone)]
pub struct SyncRequest {
  pub exhibit_id: ExhibitId,
  pub source: String,
  pub target: PathBuf,
  pub branch: Option<String>,
  pub depth: Option<u32>,
  pub account: Option<String>,
  pub token: Option<String>,
}

/// Everything one worker needs to run a single clone-or-update.
#[derive(Debug, Clone)]
pub struct SyncJob {
  pub id: Uuid,
  pub exhibit_id: ExhibitId,
  pub source: String,
  pub target: PathBuf,
  pub branch: Option<String>,
  pub depth: Option<u32>,
  pub account: Option<String>,
  pub token: Option<String>,
  pub mode: SyncMode,
}

/// Worker-side handle that pushes events onto the job's exhibit queue.
#[derive(Clone)]
pub struct EventSink {
  tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventSink {
  pub fn progress(&self, update: ProgressUpdate) {
    let _ = self.tx.send(ProgressEvent::Progress(update));
  }

  pub fn output(&self, line: impl Into<String>) {
    let _ = self.tx.send(ProgressEvent::Output { line: line.into() });
  }

  fn send(&self, event: ProgressEvent) {
    let _ = self.tx.send(event);
  }
}

/// Seam between the coordinator and the git plumbing. Object-safe so tests
/// can observe which branch (clone vs update) a request took.
pub trait Syncer: Send + Sync + 'static {
  fn sync(&self, job: &SyncJob, sink: &EventSink) -> anyhow::Result<()>;
}

struct Queue {
  tx: mpsc::UnboundedSender<ProgressEvent>,
  rx: parking_lot::Mutex<mpsc::UnboundedReceiver<ProgressEvent>>,
}

impl Queue {
  fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx: parking_lot::Mutex::new(rx) }
  }
}

/// Owns the per-exhibit event queues and the last-message cache. Queues are
/// written by one worker at a time (admission is serialized) and drained by
/// the broadcaster; cache entries outlive their queue so late subscribers
/// still see the terminal state.
pub(crate) struct Registry {
  queues: DashMap<ExhibitId, Arc<Queue>>,
  last_message: DashMap<ExhibitId, EventMessage>,
}

impl Registry {
  fn new() -> Self {
    Self { queues: DashMap::new(), last_message: DashMap::new() }
  }

  /// Sink for the exhibit's queue, creating (or reusing) the queue.
  fn sink(&self, exhibit_id: ExhibitId) -> EventSink {
    let queue = self
      .queues
      .entry(exhibit_id)
      .or_insert_with(|| Arc::new(Queue::new()))
      .clone();
    EventSink { tx: queue.tx.clone() }
  }

  pub(crate) fn queue_ids(&self) -> Vec<ExhibitId> {
    // Snapshot to avoid holding map shards while draining.
    self.queues.iter().map(|entry| *entry.key()).collect()
  }

  pub(crate) fn try_pop(&self, exhibit_id: ExhibitId) -> Option<ProgressEvent> {
    let queue = self.queues.get(&exhibit_id)?.clone();
    let mut rx = queue.rx.lock();
    rx.try_recv().ok()
  }

  pub(crate) fn remove_queue(&self, exhibit_id: ExhibitId) {
    self.queues.remove(&exhibit_id);
  }

  pub(crate) fn cache_put(&self, exhibit_id: ExhibitId, message: EventMessage) {
    self.last_message.insert(exhibit_id, message);
  }

  /// Latest message per exhibit, ordered by id, for replay on (re)connect.
  pub(crate) fn cache_snapshot(&self) -> Vec<EventMessage> {
    let mut messages: Vec<EventMessage> =
      self.last_message.iter().map(|entry| entry.value().clone()).collect();
    messages.sort_by_key(|message| message.exhibit_id);
    messages
  }
}

pub(crate) struct EngineInner {
  pub(crate) registry: Registry,
  admission: tokio::sync::Mutex<()>,
  lock_timeout: Duration,
  pub(crate) hub: EventHub,
  syncer: Arc<dyn Syncer>,
}

/// Coordinates sync jobs: serializes admission behind a global lock, spawns
/// one background worker per admitted job, and owns the queue registry the
/// broadcaster drains. Nothing that happens to a single job can take the
/// coordinator down.
#[derive(Clone)]
pub struct SyncEngine {
  pub(crate) inner: Arc<EngineInner>,
}

impl SyncEngine {
  pub fn new(syncer: Arc<dyn Syncer>, lock_timeout: Duration) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        registry: Registry::new(),
        admission: tokio::sync::Mutex::new(()),
        lock_timeout,
        hub: EventHub::new(),
        syncer,
      }),
    }
  }

  /// Spawn the broadcaster's drain loop. Call once at startup.
  pub fn start_broadcaster(&self) {
    broadcaster::spawn_drain_loop(self.inner.clone());
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventMessage> {
    self.inner.hub.subscribe()
  }

  /// Latest broadcast message per exhibit, for replay to a (re)connecting
  /// subscriber.
  pub fn last_messages(&self) -> Vec<EventMessage> {
    self.inner.registry.cache_snapshot()
  }

  /// Admit and start one sync. Returns as soon as the worker is spawned;
  /// everything past admission, including admission timeout itself, is
  /// reported through the event stream rather than to the caller.
  pub async fn request_sync(&self, request: SyncRequest) {
    let inner = &self.inner;
    let sink = inner.registry.sink(request.exhibit_id);
    sink.send(ProgressEvent::Waiting { message: "Waiting for a sync lock".to_string() });

    let guard = match tokio::time::timeout(inner.lock_timeout, inner.admission.lock()).await {
      Ok(guard) => guard,
      Err(_) => {
        tracing::warn!(
          exhibit_id = request.exhibit_id,
          timeout_secs = inner.lock_timeout.as_secs_f64(),
          "sync admission timed out"
        );
        sink.send(GalleryError::LockTimeout.into_event());
        return;
      }
    };

    // Translated fractions start from this same baseline, so the stream
    // never reports less than what was acknowledged here.
    sink.send(ProgressEvent::Progress(ProgressUpdate {
      progress: BASELINE_PROGRESS,
      message: "Lock acquired".to_string(),
    }));

    let job = SyncJob {
      id: Uuid::new_v4(),
      exhibit_id: request.exhibit_id,
      mode: SyncMode::for_target(&request.target),
      source: request.source,
      target: request.target,
      branch: request.branch,
      depth: request.depth,
      account: request.account,
      token: request.token,
    };
    tracing::info!(
      job_id = %job.id,
      exhibit_id = job.exhibit_id,
      mode = ?job.mode,
      target = %job.target.display(),
      "sync admitted"
    );

    let syncer = inner.syncer.clone();
    let job_id = job.id;
    let exhibit_id = job.exhibit_id;
    let worker_sink = sink.clone();
    tokio::spawn(async move {
      // git2 blocks; keep it off the request-handling executor.
      let handle = tokio::task::spawn_blocking({
        let sink = worker_sink.clone();
        move || syncer.sync(&job, &sink)
      });

      let terminal = match handle.await {
        Ok(Ok(())) => ProgressEvent::Finished,
        Ok(Err(err)) => {
          tracing::warn!(job_id = %job_id, exhibit_id, error = %err, "sync failed");
          GalleryError::sync_failure(&err).into_event()
        }
        Err(join_err) => {
          tracing::error!(job_id = %job_id, exhibit_id, error = %join_err, "sync worker panicked");
          ProgressEvent::Error {
            message: "sync worker panicked".to_string(),
            detail: join_err.to_string(),
          }
        }
      };
      worker_sink.send(terminal);
    });

    // The lock guards admission only; the job keeps running after release
    // so other exhibits can be admitted meanwhile.
    drop(guard);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Phase;
  use parking_lot::Mutex;
  use tokio::sync::broadcast::Receiver;

  struct MockSyncer {
    seen: Mutex<Vec<SyncJob>>,
    fail_with: Option<String>,
    lines: Vec<String>,
  }

  impl MockSyncer {
    fn ok(lines: &[&str]) -> Arc<Self> {
      Arc::new(Self {
        seen: Mutex::new(Vec::new()),
        fail_with: None,
        lines: lines.iter().map(|s| s.to_string()).collect(),
      })
    }

    fn failing(message: &str) -> Arc<Self> {
      Arc::new(Self {
        seen: Mutex::new(Vec::new()),
        fail_with: Some(message.to_string()),
        lines: Vec::new(),
      })
    }
  }

  impl Syncer for MockSyncer {
    fn sync(&self, job: &SyncJob, sink: &EventSink) -> anyhow::Result<()> {
      self.seen.lock().push(job.clone());
      for line in &self.lines {
        sink.output(line.clone());
      }
      match &self.fail_with {
        Some(message) => anyhow::bail!("{message}"),
        None => Ok(()),
      }
    }
  }

  fn request(exhibit_id: ExhibitId, target: &Path) -> SyncRequest {
    SyncRequest {
      exhibit_id,
      source: "https://example.com/org/repo.git".to_string(),
      target: target.to_path_buf(),
      branch: None,
      depth: None,
      account: None,
      token: None,
    }
  }

  async fn collect_until_terminal(
    rx: &mut Receiver<EventMessage>,
    exhibit_id: ExhibitId,
  ) -> Vec<EventMessage> {
    let mut seen = Vec::new();
    loop {
      let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for events")
        .expect("hub closed");
      if msg.exhibit_id != exhibit_id {
        continue;
      }
      let terminal = matches!(msg.phase, Phase::Finished | Phase::Error);
      seen.push(msg);
      if terminal {
        return seen;
      }
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn successful_job_emits_exactly_one_terminal_event_last() {
    let engine = SyncEngine::new(MockSyncer::ok(&["fetching", "done"]), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(0, &dir.path().join("missing"))).await;

    let seen = collect_until_terminal(&mut rx, 0).await;
    let terminals: Vec<_> =
      seen.iter().filter(|m| matches!(m.phase, Phase::Finished | Phase::Error)).collect();
    assert_eq!(terminals.len(), 1);
    assert_eq!(seen.last().unwrap().phase, Phase::Finished);
    assert_eq!(seen.first().unwrap().phase, Phase::Waiting);
    assert!(seen.iter().any(|m| m.phase == Phase::Syncing));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn failing_job_reports_error_with_detail() {
    let engine = SyncEngine::new(MockSyncer::failing("remote hung up"), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(3, &dir.path().join("missing"))).await;

    let seen = collect_until_terminal(&mut rx, 3).await;
    let last = seen.last().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.message.as_deref(), Some("remote hung up"));
    assert!(last.output.is_some());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn existing_target_selects_update_and_missing_selects_clone() {
    let syncer = MockSyncer::ok(&[]);
    let engine = SyncEngine::new(syncer.clone(), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(0, dir.path())).await;
    collect_until_terminal(&mut rx, 0).await;
    engine.request_sync(request(1, &dir.path().join("not-there"))).await;
    collect_until_terminal(&mut rx, 1).await;

    let seen = syncer.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].mode, SyncMode::Update);
    assert_eq!(seen[1].mode, SyncMode::Clone);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn admission_timeout_reports_single_error_and_spawns_no_worker() {
    let syncer = MockSyncer::ok(&[]);
    let engine = SyncEngine::new(syncer.clone(), Duration::from_millis(50));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let held = engine.inner.admission.lock().await;
    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(2, &dir.path().join("missing"))).await;
    drop(held);

    let seen = collect_until_terminal(&mut rx, 2).await;
    let last = seen.last().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert!(last.message.as_deref().unwrap().contains("another sync is in progress"));
    assert_eq!(
      seen.iter().filter(|m| m.phase == Phase::Error).count(),
      1
    );
    assert!(syncer.seen.lock().is_empty());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn concurrent_exhibits_keep_their_own_tags() {
    let engine = SyncEngine::new(MockSyncer::ok(&["step"]), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let (a, b) = tokio::join!(
      engine.request_sync(request(0, &dir.path().join("a"))),
      engine.request_sync(request(1, &dir.path().join("b")))
    );
    let _ = (a, b);

    let mut terminals = std::collections::HashSet::new();
    let mut per_exhibit: std::collections::HashMap<ExhibitId, Vec<Phase>> = Default::default();
    while terminals.len() < 2 {
      let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("hub closed");
      assert!(msg.exhibit_id == 0 || msg.exhibit_id == 1);
      if matches!(msg.phase, Phase::Finished | Phase::Error) {
        terminals.insert(msg.exhibit_id);
      }
      per_exhibit.entry(msg.exhibit_id).or_default().push(msg.phase);
    }
    for phases in per_exhibit.values() {
      assert_eq!(*phases.last().unwrap(), Phase::Finished);
      assert_eq!(phases[0], Phase::Waiting);
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn fractions_never_dip_below_the_admission_baseline() {
    use crate::git::progress::{ClonePhase, ProgressTranslator};

    struct Translating;
    impl Syncer for Translating {
      fn sync(&self, _: &SyncJob, sink: &EventSink) -> anyhow::Result<()> {
        // First transport reading of a fresh clone, fed through the
        // translator exactly as the git worker does.
        let mut translator = ProgressTranslator::new();
        if let Some(update) = translator.observe(ClonePhase::Counting, 1, Some(10), "counting") {
          sink.progress(update);
        }
        Ok(())
      }
    }

    let engine = SyncEngine::new(Arc::new(Translating), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(5, &dir.path().join("missing"))).await;

    let seen = collect_until_terminal(&mut rx, 5).await;
    let fractions: Vec<f64> = seen
      .iter()
      .filter(|m| m.phase == Phase::Progress)
      .map(|m| m.output.as_ref().unwrap()["progress"].as_f64().unwrap())
      .collect();
    assert!(fractions.len() >= 2, "expected the admission and transport fractions");
    for pair in fractions.windows(2) {
      assert!(pair[1] >= pair[0], "fraction decreased: {pair:?}");
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn late_subscriber_sees_cached_terminal_event() {
    let engine = SyncEngine::new(MockSyncer::ok(&[]), Duration::from_secs(5));
    engine.start_broadcaster();
    let mut rx = engine.subscribe();

    let dir = tempfile::tempdir().unwrap();
    engine.request_sync(request(4, &dir.path().join("missing"))).await;
    collect_until_terminal(&mut rx, 4).await;

    // The queue is gone, the cache entry is not.
    let replay = engine.last_messages();
    let cached = replay.iter().find(|m| m.exhibit_id == 4).unwrap();
    assert_eq!(cached.phase, Phase::Finished);
    assert!(engine.inner.registry.try_pop(4).is_none());
  }
}
