use af_core::backlog::{BacklogError, BacklogReader};
use af_core::types::LifecycleStatus;
use std::time::{Duration, SystemTime};

const BACKLOG: &str = "\
# Backlog

Intro text that is not an entry.

## 1: Add retry budget
- status: planned
- priority: 2

## 2: Wire status command
- status: implementing
- priority: 1
- artifact: status.md

## three: Unordered item
- status: done

## 4: Missing status line
- priority: 3

## 5: Bad priority
- status: planned
- priority: soon

## not a valid heading
- status: planned

## 6: Unknown status
- status: blocked

## 1: Duplicate id
- status: planned
";

fn reader_in(dir: &std::path::Path) -> BacklogReader {
    BacklogReader::new(dir.join("BACKLOG.md"), dir.join("designs"))
}

#[test]
fn parse_skips_malformed_entries_and_keeps_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_in(dir.path());

    let items = reader.parse_str(BACKLOG);
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "1", "three"]);

    let first = &items[0];
    assert_eq!(first.title, "Wire status command");
    assert_eq!(first.lifecycle_status, LifecycleStatus::ImplementationInProgress);
    assert_eq!(first.artifact_ref.as_deref(), Some("status.md"));
    assert_eq!(items[1].title, "Add retry budget");
    assert_eq!(items[2].lifecycle_status, LifecycleStatus::Done);
}

#[test]
fn entries_without_priority_follow_document_order() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_in(dir.path());
    let text = "\
## b: Second
- status: planned

## a: First explicit
- status: planned
- priority: 50

## c: Third
- status: todo
";
    let ids: Vec<String> = reader.parse_str(text).into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn out_of_range_priorities_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_in(dir.path());
    let text = "\
## 1: Zero
- status: planned
- priority: 0

## 2: Too large
- status: planned
- priority: 1000

## 3: Largest allowed
- status: planned
- priority: 999

## 4: Unranked
- status: planned
";
    let items = reader.parse_str(text);
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["3", "4"]);
    assert!(items[0].priority < items[1].priority);
}

#[test]
fn fields_after_other_heading_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_in(dir.path());
    let text = "\
## 1: Entry
- status: planned

### Notes
- status: done
";
    let items = reader.parse_str(text);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].lifecycle_status, LifecycleStatus::Planned);
}

#[test]
fn has_artifact_checks_default_and_explicit_locations() {
    let dir = tempfile::tempdir().unwrap();
    let designs = dir.path().join("designs");
    std::fs::create_dir_all(&designs).unwrap();
    std::fs::write(designs.join("1.md"), "design").unwrap();
    std::fs::write(designs.join("status.md"), "design").unwrap();

    let reader = reader_in(dir.path());
    let items = reader.parse_str(BACKLOG);
    let by_id = |id: &str| items.iter().find(|i| i.id == id).unwrap();

    assert!(by_id("1").has_artifact);
    assert!(by_id("2").has_artifact);
    assert!(!by_id("three").has_artifact);
    assert_eq!(reader.artifact_path(by_id("three")), designs.join("three.md"));
}

#[test]
fn has_changed_tracks_modification_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("BACKLOG.md");
    std::fs::write(&path, BACKLOG).unwrap();
    let mut reader = reader_in(dir.path());

    assert!(reader.has_changed().unwrap(), "never read before");
    let items = reader.parse().unwrap();
    assert_eq!(items.len(), 3);
    assert!(!reader.has_changed().unwrap());

    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    assert!(reader.has_changed().unwrap());

    reader.parse().unwrap();
    assert!(!reader.has_changed().unwrap());
    reader.invalidate();
    assert!(reader.has_changed().unwrap());
}

#[test]
fn last_seen_mtime_can_be_seeded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("BACKLOG.md"), BACKLOG).unwrap();

    let mut first = reader_in(dir.path());
    first.parse().unwrap();
    let seen = first.last_seen_mtime();
    assert!(seen.is_some());

    let mut second = reader_in(dir.path());
    second.set_last_seen_mtime(seen);
    assert!(!second.has_changed().unwrap());
}

#[test]
fn missing_file_is_transient_missing_directory_is_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let mut reader = reader_in(dir.path());
    let err = reader.parse().unwrap_err();
    assert!(matches!(err, BacklogError::Unreadable { .. }));
    assert!(!err.is_permanent());

    let mut gone = BacklogReader::new(
        dir.path().join("no-such-dir").join("BACKLOG.md"),
        dir.path().join("designs"),
    );
    let err = gone.parse().unwrap_err();
    assert!(err.is_permanent());
}
