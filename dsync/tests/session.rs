//! End-to-end sessions between a source agent and a destination agent running in
//! the same process, connected through in-memory pipes and a loopback data channel.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::{Arc, Mutex};

use common::error::SyncError;
use common::listing::{FileRecord, Stat};
use common::options::Options;
use common::supervisor::CancellationFlag;
use common::testutils;
use dsync_tools_dsync::destination::RemoteAgent;
use dsync_tools_dsync::source::{LocalAgent, ProgressSink, ServeStats};
use remote::protocol::{Command, RelayEvent, Response};
use remote::streams::CommandChannel;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

type Pipe = CommandChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Outcome {
    local: Result<i32, SyncError>,
    remote: i32,
    stats: ServeStats,
    physical_reads: u64,
    events: Vec<RelayEvent>,
}

fn pipe() -> (Pipe, (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>)) {
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(ours);
    (CommandChannel::new(reader, writer), tokio::io::split(theirs))
}

fn options() -> Options {
    Options {
        dest_addr: Some(std::net::Ipv4Addr::LOCALHOST.into()),
        ..Default::default()
    }
}

/// Runs one session, passing every response through `tamper` on its way to the
/// destination agent.
async fn session_with(
    source: &Path,
    dest: &Path,
    options: Options,
    cancel: CancellationFlag,
    tamper: fn(&mut Response),
) -> Outcome {
    let (mut local_channel, (local_reader, local_writer)) = pipe();
    let (remote_channel, (remote_reader, remote_writer)) = pipe();
    let events = Arc::new(Mutex::new(Vec::<RelayEvent>::new()));
    let sink = {
        let events = events.clone();
        ProgressSink::Callback(Box::new(move |event: RelayEvent| events.lock().unwrap().push(event)))
    };
    let mut agent = LocalAgent::new(
        source.to_path_buf(),
        dest.display().to_string(),
        options,
        cancel,
        sink,
    );
    let local = async move {
        let result = agent.serve(&mut local_channel).await;
        drop(local_channel);
        (result, agent)
    };
    let requests = async move {
        let mut forward = CommandChannel::new(remote_reader, local_writer);
        while let Ok(Some(command)) = forward.receive::<Command>().await {
            if forward.send(&command).await.is_err() {
                break;
            }
        }
    };
    let responses = async move {
        let mut forward = CommandChannel::new(local_reader, remote_writer);
        while let Ok(Some(mut response)) = forward.receive::<Response>().await {
            tamper(&mut response);
            if forward.send(&response).await.is_err() {
                break;
            }
        }
    };
    let ((local, agent), remote, (), ()) = tokio::join!(
        local,
        RemoteAgent::new(remote_channel).run(),
        requests,
        responses
    );
    let events = events.lock().unwrap().clone();
    Outcome {
        local,
        remote,
        stats: agent.stats(),
        physical_reads: agent.physical_reads(),
        events,
    }
}

async fn session(source: &Path, dest: &Path, options: Options) -> Outcome {
    session_with(source, dest, options, CancellationFlag::default(), |_| {}).await
}

fn progress_lines(outcome: &Outcome) -> Vec<String> {
    outcome
        .events
        .iter()
        .filter_map(|event| match event {
            RelayEvent::Progress(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn assert_mirrors_sample(dest: &Path) {
    assert_eq!(read(dest.join("a/b/c.txt")), "c");
    assert_eq!(read(dest.join("a/d.txt")), "d contents");
    assert_eq!(read(dest.join("f1")), "A".repeat(10));
    assert_eq!(read(dest.join("f2")), "A".repeat(10));
    assert_eq!(read(dest.join("x/q.txt")), "q");
    assert_eq!(read(dest.join("y/z.txt")), "z");
    assert_eq!(
        std::fs::read_link(dest.join("link")).unwrap(),
        Path::new("a/d.txt")
    );
    let f1 = std::fs::metadata(dest.join("f1")).unwrap();
    let f2 = std::fs::metadata(dest.join("f2")).unwrap();
    assert_eq!(f1.ino(), f2.ino(), "hard link must be preserved");
}

/// Overwrites `path` keeping its size and modification time.
fn corrupt(path: &Path, contents: &str) {
    let metadata = std::fs::metadata(path).unwrap();
    assert_eq!(metadata.len(), contents.len() as u64);
    std::fs::write(path, contents).unwrap();
    filetime::set_file_mtime(
        path,
        filetime::FileTime::from_last_modification_time(&metadata),
    )
    .unwrap();
}

#[tokio::test]
async fn first_run_mirrors_the_tree() {
    let source = testutils::sample_tree().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("mirror");
    let outcome = session(source.path(), &dest, options()).await;
    assert_eq!(outcome.local.unwrap(), 0);
    assert_eq!(outcome.remote, 0);
    assert_mirrors_sample(&dest);
    // five regular files, f2 is linked rather than fetched
    assert_eq!(outcome.stats.data_requests, 5);
    assert_eq!(outcome.stats.digest_requests, 5);
    // every digest is served from the chunk read for the data
    assert_eq!(outcome.physical_reads, 5);
}

#[tokio::test]
async fn hard_linked_pair_is_transferred_once() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("f1"), "A".repeat(10)).unwrap();
    std::fs::hard_link(source.path().join("f1"), source.path().join("f2")).unwrap();
    let dest = tempfile::tempdir().unwrap();
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 1);
    let f1 = std::fs::metadata(dest.path().join("f1")).unwrap();
    let f2 = std::fs::metadata(dest.path().join("f2")).unwrap();
    assert_eq!(f1.ino(), f2.ino());
    assert_eq!(read(dest.path().join("f2")), "A".repeat(10));
}

#[tokio::test]
async fn second_run_transfers_nothing() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 0);
    assert_eq!(outcome.stats.bytes_sent, 0);
    assert_mirrors_sample(dest.path());
}

#[tokio::test]
async fn attributes_follow_the_source() {
    let source = testutils::sample_tree().unwrap();
    std::fs::set_permissions(
        source.path().join("a/d.txt"),
        std::fs::Permissions::from_mode(0o600),
    )
    .unwrap();
    std::fs::set_permissions(source.path().join("x"), std::fs::Permissions::from_mode(0o750))
        .unwrap();
    let old = filetime::FileTime::from_unix_time(1_000_000_000, 0);
    filetime::set_file_mtime(source.path().join("y/z.txt"), old).unwrap();
    filetime::set_file_mtime(source.path().join("y"), old).unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    let mode = |path: &str| std::fs::metadata(dest.path().join(path)).unwrap().mode() & 0o7777;
    assert_eq!(mode("a/d.txt"), 0o600);
    assert_eq!(mode("x"), 0o750);
    let mtime = |path: &str| {
        filetime::FileTime::from_last_modification_time(
            &std::fs::metadata(dest.path().join(path)).unwrap(),
        )
    };
    assert_eq!(mtime("y/z.txt"), old);
    assert_eq!(mtime("y"), old);
}

#[tokio::test]
async fn silent_corruption_is_repaired() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    corrupt(&dest.path().join("a/d.txt"), "d contentX");
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 1);
    assert_eq!(read(dest.path().join("a/d.txt")), "d contents");
}

#[tokio::test]
async fn corrupted_hard_link_is_replaced_as_a_whole() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    corrupt(&dest.path().join("f1"), &"B".repeat(10));
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 1);
    assert_mirrors_sample(dest.path());
}

#[tokio::test]
async fn insecure_mode_trusts_size_and_mtime() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    corrupt(&dest.path().join("a/d.txt"), "d contentX");
    let insecure = Options {
        insecure: true,
        ..options()
    };
    let outcome = session(source.path(), dest.path(), insecure).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 0);
    assert_eq!(outcome.stats.digest_requests, 0);
    assert_eq!(read(dest.path().join("a/d.txt")), "d contentX");
}

#[tokio::test]
async fn changed_files_are_fetched_again() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    assert_eq!(session(source.path(), dest.path(), options()).await.remote, 0);
    std::fs::write(source.path().join("x/q.txt"), "a longer q").unwrap();
    std::fs::write(source.path().join("new.txt"), "new").unwrap();
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 2);
    assert_eq!(read(dest.path().join("x/q.txt")), "a longer q");
    assert_eq!(read(dest.path().join("new.txt")), "new");
}

#[tokio::test]
async fn compressed_transfer_of_multiple_chunks() {
    let source = tempfile::tempdir().unwrap();
    let big = "0123456789abcdef".repeat(3 * 64 * 1024 + 100);
    std::fs::write(source.path().join("big"), &big).unwrap();
    std::fs::write(source.path().join("empty"), "").unwrap();
    let dest = tempfile::tempdir().unwrap();
    let compressed = Options {
        compress: true,
        ..options()
    };
    let outcome = session(source.path(), dest.path(), compressed).await;
    assert_eq!(outcome.remote, 0);
    assert_eq!(outcome.stats.data_requests, 4);
    assert!(outcome.stats.bytes_sent < big.len() as u64 / 10);
    assert_eq!(read(dest.path().join("big")), big);
    assert_eq!(read(dest.path().join("empty")), "");
}

#[tokio::test]
async fn kind_changes_replace_destination_entries() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    // a directory where the source has a file, a file where it has a directory
    std::fs::create_dir_all(dest.path().join("f1/nested")).unwrap();
    std::fs::write(dest.path().join("a"), "not a directory").unwrap();
    std::os::unix::fs::symlink("elsewhere", dest.path().join("link")).unwrap();
    std::fs::write(dest.path().join("y"), "not a directory either").unwrap();
    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert_mirrors_sample(dest.path());
}

#[tokio::test]
async fn delete_removes_destination_only_entries() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dest.path().join("extra/deeper")).unwrap();
    std::fs::write(dest.path().join("extra/deeper/file"), "x").unwrap();
    std::fs::write(dest.path().join("stale.txt"), "x").unwrap();
    std::fs::create_dir(dest.path().join("keep")).unwrap();
    std::fs::write(dest.path().join("keep/file"), "x").unwrap();

    let outcome = session(source.path(), dest.path(), options()).await;
    assert_eq!(outcome.remote, 0);
    assert!(dest.path().join("stale.txt").exists());

    let mut deleting = Options {
        delete: true,
        ..options()
    };
    deleting.add_exclude("keep").unwrap();
    let outcome = session(source.path(), dest.path(), deleting).await;
    assert_eq!(outcome.remote, 0);
    assert!(!dest.path().join("extra").exists());
    assert!(!dest.path().join("stale.txt").exists());
    // excluded paths are never listed, so never deleted
    assert!(dest.path().join("keep/file").exists());
    assert_mirrors_sample(dest.path());
}

#[tokio::test]
async fn excluded_and_not_included_paths_are_skipped() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut excluding = options();
    excluding.add_exclude("x").unwrap();
    excluding.add_exclude("a/b/c.txt").unwrap();
    assert_eq!(session(source.path(), dest.path(), excluding).await.remote, 0);
    assert!(!dest.path().join("x").exists());
    assert!(!dest.path().join("a/b/c.txt").exists());
    assert!(dest.path().join("a/b").is_dir());
    assert!(dest.path().join("y/z.txt").exists());

    let other = tempfile::tempdir().unwrap();
    let mut including = options();
    including.add_include("a").unwrap();
    assert_eq!(session(source.path(), other.path(), including).await.remote, 0);
    assert_eq!(read(other.path().join("a/b/c.txt")), "c");
    assert!(!other.path().join("f1").exists());
    assert!(!other.path().join("y").exists());
}

#[tokio::test]
async fn dry_run_only_reports() {
    let source = testutils::sample_tree().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("not-yet");
    let dry = Options {
        dry_run: true,
        ..options()
    };
    let outcome = session(source.path(), &dest, dry).await;
    assert_eq!(outcome.remote, 0);
    assert!(!dest.exists());
    assert_eq!(outcome.stats.data_requests, 0);
    let lines = progress_lines(&outcome);
    assert!(lines.contains(&"would transfer ./a/d.txt (10 bytes)".to_string()));
    assert!(lines.iter().all(|line| !line.contains("./f2")));
    assert!(lines.last().unwrap().contains("23 bytes"));
}

#[tokio::test]
async fn progress_is_reported_when_requested() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let reporting = Options {
        send_progress: true,
        send_raw_progress: true,
        ..options()
    };
    let outcome = session(source.path(), dest.path(), reporting).await;
    assert_eq!(outcome.remote, 0);
    let lines = progress_lines(&outcome);
    assert_eq!(
        lines.last().unwrap(),
        &format!(
            "23/23 (100.0%) bytes, 5/5 files, {} transferred",
            bytesize::ByteSize(23)
        )
    );
    let Some(RelayEvent::RawProgress(last)) = outcome
        .events
        .iter()
        .rfind(|event| matches!(event, RelayEvent::RawProgress(_)))
    else {
        panic!("no raw progress received");
    };
    assert!(last.done);
    assert_eq!(last.files_transferred, 5);

    let silent = session(source.path(), dest.path(), options()).await;
    assert!(silent.events.is_empty());
}

fn add_ghost(response: &mut Response) {
    if let Response::List(listing) = response {
        let stat = Stat {
            mode: 0o100644,
            size: 4,
            mtime: 1,
            mtime_nsec: 0,
            uid: 0,
            gid: 0,
        };
        listing.insert("./ghost".to_string(), FileRecord::Regular(stat));
        listing.insert(
            "./ghost-link".to_string(),
            FileRecord::Alias {
                target: "./ghost".to_string(),
            },
        );
    }
}

#[tokio::test]
async fn unreadable_source_file_is_skipped() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let outcome = session_with(
        source.path(),
        dest.path(),
        options(),
        CancellationFlag::default(),
        add_ghost,
    )
    .await;
    assert_eq!(outcome.remote, 1);
    assert_eq!(outcome.local.unwrap(), 1);
    assert_eq!(outcome.stats.failed_requests, 1);
    assert!(!dest.path().join("ghost").exists());
    assert!(!dest.path().join("ghost-link").exists());
    assert!(!dest.path().join(".ghost.dsync-tmp").exists());
    // everything else still arrives
    assert_mirrors_sample(dest.path());
}

#[tokio::test]
async fn vanished_controller_stops_the_session() {
    let source = testutils::sample_tree().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let cancel = CancellationFlag::default();
    cancel.cancel();
    let outcome = session_with(source.path(), dest.path(), options(), cancel, |_| {}).await;
    let error = outcome.local.unwrap_err();
    assert!(matches!(error, SyncError::Cancelled));
    assert_eq!(error.exit_code(), 2);
    assert_eq!(outcome.remote, 3);
    assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
}
