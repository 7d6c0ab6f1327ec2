//! Integration tests for the conversion orchestrator.
//!
//! These drive the full submit -> queue -> worker -> sink path with a
//! scripted in-process vectorizer, so no vtracer binary is needed.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test orchestrator_test
//! ```

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use vectorize_worker::{
    converter::Vectorizer,
    error::{ConvertError, SubmitError},
    job::{ConversionOptions, ConversionResult, Delivery},
    orchestrator::Orchestrator,
};

const WAIT: Duration = Duration::from_secs(10);

/// Vectorizer double that answers `<svg>{stem}</svg>`.
///
/// Sources can be gated so their conversion blocks until the test releases
/// them. Sources whose name starts with `broken` fail.
struct ScriptedVectorizer {
    gates: Mutex<HashMap<PathBuf, std_mpsc::Receiver<()>>>,
    started: mpsc::UnboundedSender<PathBuf>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedVectorizer {
    fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<PathBuf>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let vectorizer = Arc::new(Self {
            gates: Mutex::new(HashMap::new()),
            started,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        (vectorizer, started_rx)
    }

    /// Blocks conversions of `source` until the returned sender fires.
    fn gate(&self, source: &Path) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        self.gates.lock().insert(source.to_path_buf(), rx);
        tx
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Vectorizer for ScriptedVectorizer {
    fn vectorize(&self, source: &Path, _options: &ConversionOptions) -> Result<Vec<u8>, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _ = self.started.send(source.to_path_buf());

        let gate = self.gates.lock().remove(source);
        match gate {
            Some(gate) => {
                let _ = gate.recv();
            }
            None => std::thread::sleep(self.delay),
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if stem.starts_with("broken") {
            return Err(ConvertError::Exited {
                status: "exit status: 1".to_string(),
                stderr: format!("cannot decode {}", stem),
            });
        }
        Ok(format!("<svg>{}</svg>", stem).into_bytes())
    }
}

/// Creates empty source images in a temp dir.
fn sources(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
    let dir = TempDir::new().unwrap();
    let paths = names
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, b"raster").unwrap();
            path
        })
        .collect();
    (dir, paths)
}

fn svg(text: &str) -> ConversionResult {
    ConversionResult::Success {
        svg_bytes: text.as_bytes().to_vec(),
    }
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

async fn wait_started(rx: &mut mpsc::UnboundedReceiver<PathBuf>) -> PathBuf {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for conversion to start")
        .expect("vectorizer dropped")
}

/// Submit cat.png to a.svg, resubmit dog.png before cat finishes: only the
/// dog result (generation 2) is delivered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubmission_supersedes_running_job() {
    let (_dir, paths) = sources(&["cat.png", "dog.png"]);
    let (vectorizer, mut started) = ScriptedVectorizer::new(Duration::ZERO);
    let release_cat = vectorizer.gate(&paths[0]);

    let orchestrator = Orchestrator::start(2, vectorizer.clone());
    let mut results = orchestrator.subscribe_channel("a.svg");

    let first = orchestrator
        .submit("a.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(wait_started(&mut started).await, paths[0]);

    let second = orchestrator
        .submit("a.svg", &paths[1], ConversionOptions::default())
        .unwrap();
    assert_eq!(second, 2);

    let delivery = next_delivery(&mut results).await;
    assert_eq!(delivery.output_path, PathBuf::from("a.svg"));
    assert_eq!(delivery.generation, 2);
    assert_eq!(delivery.result, svg("<svg>dog</svg>"));

    // let the superseded cat conversion finish; its result must vanish
    release_cat.send(()).unwrap();
    orchestrator.shutdown().await;

    assert!(results.try_recv().is_err());
    assert_eq!(vectorizer.calls(), 2);
}

/// With a single worker the resubmission waits in the queue and replaces
/// nothing but the pending slot; the first result is still suppressed.
#[tokio::test]
async fn test_resubmission_while_single_worker_busy() {
    let (_dir, paths) = sources(&["cat.png", "dog.png"]);
    let (vectorizer, mut started) = ScriptedVectorizer::new(Duration::ZERO);
    let release_cat = vectorizer.gate(&paths[0]);

    let orchestrator = Orchestrator::start(1, vectorizer.clone());
    let mut results = orchestrator.subscribe_channel("a.svg");

    orchestrator
        .submit("a.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    wait_started(&mut started).await;
    orchestrator
        .submit("a.svg", &paths[1], ConversionOptions::default())
        .unwrap();
    assert_eq!(orchestrator.pending(), 1);

    release_cat.send(()).unwrap();

    let delivery = next_delivery(&mut results).await;
    assert_eq!(delivery.generation, 2);
    assert_eq!(delivery.result, svg("<svg>dog</svg>"));

    orchestrator.shutdown().await;
    assert!(results.try_recv().is_err());
}

/// A burst of submissions to one output delivers exactly one result, for
/// the last submission, and never runs the intermediate ones.
#[tokio::test]
async fn test_burst_delivers_only_last_generation() {
    let names: Vec<String> = (0..10).map(|i| format!("frame{}.png", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (_dir, paths) = sources(&name_refs);
    let (vectorizer, mut started) = ScriptedVectorizer::new(Duration::ZERO);
    let release_first = vectorizer.gate(&paths[0]);

    let orchestrator = Orchestrator::start(1, vectorizer.clone());
    let mut results = orchestrator.subscribe_channel("movie.svg");

    orchestrator
        .submit("movie.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    wait_started(&mut started).await;

    let mut last = 0;
    for path in &paths[1..] {
        last = orchestrator
            .submit("movie.svg", path, ConversionOptions::default())
            .unwrap();
    }
    assert_eq!(last, 10);
    release_first.send(()).unwrap();

    let delivery = next_delivery(&mut results).await;
    assert_eq!(delivery.generation, 10);
    assert_eq!(delivery.result, svg("<svg>frame9</svg>"));

    orchestrator.shutdown().await;
    assert!(results.try_recv().is_err());
    // first frame (already running) and last frame only
    assert_eq!(vectorizer.calls(), 2);
}

/// Distinct outputs each get exactly one result, in any order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_outputs_each_delivered_once() {
    let names = ["a.png", "b.png", "c.png", "d.png", "e.png", "f.png"];
    let (dir, paths) = sources(&names);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::from_millis(10));
    let orchestrator = Orchestrator::start(names.len(), vectorizer);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for path in &paths {
        let output = path.with_extension("svg");
        let tx = tx.clone();
        orchestrator.subscribe(output.clone(), move |delivery| {
            let _ = tx.send(delivery);
        });
        orchestrator
            .submit(output, path, ConversionOptions::default())
            .unwrap();
    }

    let mut delivered = HashSet::new();
    for _ in 0..names.len() {
        let delivery = next_delivery(&mut rx).await;
        assert_eq!(delivery.generation, 1);
        assert!(delivery.result.is_success());
        assert!(delivered.insert(delivery.output_path));
    }

    orchestrator.shutdown().await;
    assert!(rx.try_recv().is_err());

    let expected: HashSet<PathBuf> = names
        .iter()
        .map(|name| dir.path().join(name).with_extension("svg"))
        .collect();
    assert_eq!(delivered, expected);
}

/// More pending jobs than workers never exceeds the concurrency limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_respected() {
    let names: Vec<String> = (0..8).map(|i| format!("img{}.png", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (_dir, paths) = sources(&name_refs);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::from_millis(30));
    let orchestrator = Orchestrator::start(2, vectorizer.clone());
    assert_eq!(orchestrator.concurrency(), 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for path in &paths {
        let output = path.with_extension("svg");
        let tx = tx.clone();
        orchestrator.subscribe(output.clone(), move |delivery| {
            let _ = tx.send(delivery);
        });
        orchestrator
            .submit(output, path, ConversionOptions::default())
            .unwrap();
    }

    for _ in 0..paths.len() {
        next_delivery(&mut rx).await;
    }
    orchestrator.shutdown().await;

    assert_eq!(vectorizer.calls(), 8);
    assert!(vectorizer.peak() <= 2, "peak concurrency {}", vectorizer.peak());
}

/// Shutdown waits for the running conversion, claims nothing new, and
/// reports the queued job as cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_job() {
    let (_dir, paths) = sources(&["cat.png", "dog.png"]);
    let (vectorizer, mut started) = ScriptedVectorizer::new(Duration::ZERO);
    let release_cat = vectorizer.gate(&paths[0]);

    let orchestrator = Arc::new(Orchestrator::start(1, vectorizer.clone()));
    let mut cat_results = orchestrator.subscribe_channel("cat.svg");
    let mut dog_results = orchestrator.subscribe_channel("dog.svg");

    orchestrator
        .submit("cat.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    wait_started(&mut started).await;
    orchestrator
        .submit("dog.svg", &paths[1], ConversionOptions::default())
        .unwrap();

    let mut shutdown = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.shutdown().await })
    };

    // still blocked on the running cat conversion
    assert!(timeout(Duration::from_millis(100), &mut shutdown).await.is_err());
    assert_eq!(
        orchestrator.submit("cow.svg", &paths[1], ConversionOptions::default()),
        Err(SubmitError::ShutDown)
    );

    release_cat.send(()).unwrap();
    timeout(WAIT, shutdown).await.unwrap().unwrap();

    assert_eq!(next_delivery(&mut cat_results).await.result, svg("<svg>cat</svg>"));
    assert_eq!(
        next_delivery(&mut dog_results).await.result,
        ConversionResult::Cancelled
    );
    assert_eq!(vectorizer.calls(), 1);
}

/// Cancelling a running job delivers a cancellation notice right away and
/// suppresses the conversion result when it eventually arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job() {
    let (_dir, paths) = sources(&["cat.png"]);
    let (vectorizer, mut started) = ScriptedVectorizer::new(Duration::ZERO);
    let release_cat = vectorizer.gate(&paths[0]);

    let orchestrator = Orchestrator::start(1, vectorizer.clone());
    let mut results = orchestrator.subscribe_channel("a.svg");

    orchestrator
        .submit("a.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    wait_started(&mut started).await;

    assert!(orchestrator.cancel("a.svg"));
    assert!(!orchestrator.cancel("a.svg"));

    let delivery = next_delivery(&mut results).await;
    assert_eq!(delivery.generation, 1);
    assert_eq!(delivery.result, ConversionResult::Cancelled);

    release_cat.send(()).unwrap();
    orchestrator.shutdown().await;
    assert!(results.try_recv().is_err());
}

/// A failing conversion is delivered as a failure, not raised.
#[tokio::test]
async fn test_conversion_failure_is_delivered() {
    let (_dir, paths) = sources(&["broken.png"]);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::ZERO);
    let orchestrator = Orchestrator::start(1, vectorizer);
    let mut results = orchestrator.subscribe_channel("a.svg");

    orchestrator
        .submit("a.svg", &paths[0], ConversionOptions::default())
        .unwrap();

    match next_delivery(&mut results).await.result {
        ConversionResult::Failure { reason } => assert!(reason.contains("cannot decode broken")),
        other => panic!("expected failure, got {:?}", other),
    }

    orchestrator.shutdown().await;
}

/// Problems detectable up front are rejected synchronously.
#[tokio::test]
async fn test_invalid_input_rejected_at_submission() {
    let (dir, paths) = sources(&["cat.png", "notes.txt"]);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::ZERO);
    let orchestrator = Orchestrator::start(1, vectorizer.clone());

    let missing = dir.path().join("missing.png");
    assert_eq!(
        orchestrator.submit("a.svg", &missing, ConversionOptions::default()),
        Err(SubmitError::SourceUnreadable(missing.clone()))
    );
    assert_eq!(
        orchestrator.submit("a.svg", &paths[1], ConversionOptions::default()),
        Err(SubmitError::UnsupportedFormat(paths[1].clone()))
    );

    let options = ConversionOptions {
        corner_threshold: 181,
        ..Default::default()
    };
    let err = orchestrator.submit("a.svg", &paths[0], options).unwrap_err();
    assert!(err.is_invalid_input());
    assert!(matches!(
        err,
        SubmitError::OptionOutOfRange {
            name: "corner_threshold",
            ..
        }
    ));

    orchestrator.shutdown().await;
    assert_eq!(vectorizer.calls(), 0);
}

/// Sources that exist but cannot be read as a regular file are rejected
/// up front instead of failing later on a worker.
#[tokio::test]
async fn test_unreadable_source_rejected_at_submission() {
    use std::os::unix::fs::PermissionsExt;

    let (dir, paths) = sources(&["locked.png"]);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::ZERO);
    let orchestrator = Orchestrator::start(1, vectorizer.clone());

    let folder = dir.path().join("folder.png");
    std::fs::create_dir(&folder).unwrap();
    assert_eq!(
        orchestrator.submit("a.svg", &folder, ConversionOptions::default()),
        Err(SubmitError::SourceUnreadable(folder.clone()))
    );

    let locked = &paths[0];
    std::fs::set_permissions(locked, std::fs::Permissions::from_mode(0o000)).unwrap();
    // root ignores file modes
    if std::fs::File::open(locked).is_err() {
        assert_eq!(
            orchestrator.submit("b.svg", locked, ConversionOptions::default()),
            Err(SubmitError::SourceUnreadable(locked.clone()))
        );
    }

    orchestrator.shutdown().await;
    assert_eq!(vectorizer.calls(), 0);
}

/// Results for an output nobody observes are dropped without blocking
/// later deliveries.
#[tokio::test]
async fn test_unobserved_output_is_dropped() {
    let (_dir, paths) = sources(&["cat.png", "dog.png"]);
    let (vectorizer, _started) = ScriptedVectorizer::new(Duration::ZERO);
    let orchestrator = Orchestrator::start(1, vectorizer);
    let mut results = orchestrator.subscribe_channel("dog.svg");

    orchestrator
        .submit("cat.svg", &paths[0], ConversionOptions::default())
        .unwrap();
    orchestrator
        .submit("dog.svg", &paths[1], ConversionOptions::default())
        .unwrap();

    let delivery = next_delivery(&mut results).await;
    assert_eq!(delivery.output_path, PathBuf::from("dog.svg"));

    assert!(orchestrator.unsubscribe("dog.svg"));
    assert!(!orchestrator.unsubscribe("dog.svg"));
    orchestrator.shutdown().await;
}
