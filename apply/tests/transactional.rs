use std::fs;

use pilot_apply::Applier;
use pilot_apply::ApplyError;
use pilot_apply::FileEdit;
use pilot_apply::ProgressPhase;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn edit(dir: &TempDir, name: &str, original: &str, edited: &str) -> FileEdit {
    FileEdit {
        path: dir.path().join(name),
        original: original.to_string(),
        edited: edited.to_string(),
    }
}

#[test]
fn batch_applies_in_order_and_creates_parents() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "foo").expect("seed");

    let mut applier = Applier::new();
    let applied = applier
        .apply(
            &[
                edit(&dir, "a.txt", "foo", "bar"),
                edit(&dir, "nested/deep/b.txt", "", "new"),
            ],
            None,
        )
        .expect("apply");

    assert_eq!(applied.len(), 2);
    assert_eq!(fs::read_to_string(dir.path().join("a.txt")).expect("a"), "bar");
    assert_eq!(
        fs::read_to_string(dir.path().join("nested/deep/b.txt")).expect("b"),
        "new"
    );
}

#[test]
fn failure_rolls_back_prior_writes_and_created_files() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "foo").expect("seed");

    let mut applier = Applier::new();
    let err = applier
        .apply(
            &[
                edit(&dir, "a.txt", "foo", "bar"),
                edit(&dir, "b.txt", "", "new"),
                edit(&dir, "c.txt", "baz", "qux"),
            ],
            None,
        )
        .expect_err("third edit must fail");

    assert!(matches!(err, ApplyError::MatchFailed { .. }));
    // a.txt restored, b.txt removed again.
    assert_eq!(fs::read_to_string(dir.path().join("a.txt")).expect("a"), "foo");
    assert!(!dir.path().join("b.txt").exists());
    assert_eq!(applier.undo_depth(), 0);
}

#[test]
fn undo_restores_the_pre_apply_snapshot() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "one two one").expect("seed");

    let mut applier = Applier::new();
    applier
        .apply(
            &[
                edit(&dir, "a.txt", "one", "1"),
                edit(&dir, "b.txt", "", "created"),
            ],
            None,
        )
        .expect("apply");

    assert_eq!(
        fs::read_to_string(dir.path().join("a.txt")).expect("a"),
        "1 two 1"
    );
    assert!(applier.undo_last_apply());
    assert_eq!(
        fs::read_to_string(dir.path().join("a.txt")).expect("a"),
        "one two one"
    );
    assert!(!dir.path().join("b.txt").exists());
    assert!(!applier.undo_last_apply());
}

#[test]
fn progress_callback_sees_start_and_done_per_file() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "x").expect("seed");

    let mut phases = Vec::new();
    let mut callback = |path: &std::path::Path,
                        existed: bool,
                        idx: usize,
                        total: usize,
                        phase: ProgressPhase| {
        phases.push((
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            existed,
            idx,
            total,
            phase,
        ));
    };

    let mut applier = Applier::new();
    applier
        .apply(&[edit(&dir, "a.txt", "x", "y")], Some(&mut callback))
        .expect("apply");

    assert_eq!(
        phases,
        vec![
            ("a.txt".to_string(), true, 0, 1, ProgressPhase::Start),
            ("a.txt".to_string(), true, 0, 1, ProgressPhase::Done),
        ]
    );
}
