//! Archive construction scenarios: exclusions, special files, determinism

mod fixtures;

use std::fs;

use fixtures::{extract_only, quiet_runner, Workspace};
use serde_json::json;
use shellpack::archive::{ExcludeRules, ExclusionReason};
use shellpack::checksum;
use shellpack::Archiver;

#[test]
fn test_excluded_directory_is_not_descended() {
    let ws = Workspace::new();
    ws.write("keep.txt", "keep");
    ws.write("cache/a.bin", "a");
    ws.write("cache/deeper/b.bin", "b");
    ws.write("src/cache.txt", "not a directory");

    let report = ws.build(json!({"exclude": {"patterns": ["cache/"]}}));
    let manifest = report.manifest();

    let excluded: Vec<&str> = manifest.excluded.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(excluded, vec!["cache/"]);
    assert_eq!(manifest.excluded[0].reason, ExclusionReason::Pattern);
    assert_eq!(manifest.excluded[0].pattern, "cache/");

    let included: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(included, vec!["keep.txt", "src/cache.txt"]);
}

#[test]
fn test_every_path_is_included_or_excluded_once() {
    let ws = Workspace::new();
    ws.write("a.log", "1");
    ws.write("b.txt", "2");
    ws.write("logs/c.log", "3");
    ws.write("logs/d.txt", "4");

    let report = ws.build(json!({"exclude": {"patterns": ["*.log"]}}));
    let manifest = report.manifest();
    let mut all: Vec<&str> = manifest
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(manifest.excluded.iter().map(|e| e.path.as_str()))
        .collect();
    all.sort();
    assert_eq!(all, vec!["a.log", "b.txt", "logs/c.log", "logs/d.txt"]);
    assert!(manifest.excluded.iter().all(|e| !e.is_dir()));
}

#[test]
fn test_ignore_case_matching() {
    let ws = Workspace::new();
    ws.write("APP.LOG", "x");
    ws.write("app.txt", "y");

    let report = ws.build(json!({"exclude": {"patterns": ["*.log"], "ignore_case": true}}));
    assert_eq!(report.manifest().files.len(), 1);

    let report = ws.build(json!({"exclude": {"patterns": ["*.log"], "ignore_case": false}}));
    assert_eq!(report.manifest().files.len(), 2);
}

#[test]
fn test_standard_excludes() {
    let ws = Workspace::new();
    ws.write(".git/HEAD", "ref");
    ws.write("__pycache__/m.pyc", "x");
    ws.write("notes.tmp", "x");
    ws.write("main.py", "print()");

    let report = ws.build(json!({"exclude": {"standard": true}}));
    let included: Vec<&str> = report.manifest().files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(included, vec!["main.py"]);
}

/// Zero-byte file, symlink, 10 MB file and an excluded log
#[cfg(unix)]
#[test]
fn test_special_files_scenario() {
    let ws = Workspace::new();
    ws.write("empty.dat", "");
    ws.write("target.txt", "target");
    std::os::unix::fs::symlink("target.txt", ws.content().join("link")).unwrap();
    let big: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    ws.write("big.bin", &big);
    ws.write("debug.log", "noise");

    let overrides = json!({"exclude": {"patterns": ["*.log"]}, "script": ""});
    let first = ws.build(overrides.clone());
    let manifest = first.manifest();

    let record = |path: &str| manifest.files.iter().find(|f| f.path == path).unwrap();
    assert_eq!(record("empty.dat").checksum_sha256, "empty");
    assert_eq!(record("link").checksum_sha256, "symlink");
    assert!(record("link").is_link);
    assert_eq!(record("big.bin").size, 10 * 1024 * 1024);
    assert_eq!(record("big.bin").checksum_sha256, checksum::sha256_bytes(&big));
    assert!(manifest.files.iter().all(|f| f.path != "debug.log"));
    assert_eq!(manifest.excluded.len(), 1);

    // Same tree, same archive
    let second = ws.build(overrides);
    assert_eq!(second.manifest().archive_sha256, manifest.archive_sha256);

    let out = ws.out_dir("out");
    let outcome = quiet_runner(&first.artifact, extract_only(&out), &[])
        .run()
        .unwrap();
    let verification = outcome.verification.unwrap();
    assert!(verification.is_ok());
    assert_eq!(verification.checked, 2);
    assert_eq!(fs::read_link(out.join("link")).unwrap().to_str(), Some("target.txt"));
    assert_eq!(fs::metadata(out.join("empty.dat")).unwrap().len(), 0);
    assert!(!out.join("debug.log").exists());
}

#[test]
fn test_checksum_is_idempotent() {
    let ws = Workspace::new();
    let path = ws.write("file.bin", vec![7u8; 100_000]);
    let first = checksum::sha256_file(&path).unwrap();
    let second = checksum::sha256_file(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, checksum::sha256_bytes(&fs::read(&path).unwrap()));
    assert!(checksum::is_sha256_hex(&first));
}

#[test]
fn test_archiver_directly() {
    let ws = Workspace::new();
    ws.write("x/y.txt", "y");
    ws.write("x/z.log", "z");
    let out = ws.out_dir("archive");
    fs::create_dir_all(&out).unwrap();

    let rules = ExcludeRules::new(&["*.log"], true).unwrap();
    let archive = Archiver::new(ws.content())
        .with_exclude(rules)
        .create(&out)
        .unwrap();
    assert!(archive.path.starts_with(&out));
    assert_eq!(archive.manifest.files.len(), 1);
    assert_eq!(
        archive.manifest.archive_sha256,
        checksum::sha256_file(&archive.path).unwrap()
    );
}
