/// Command-line interface tests for engramctl.
///
/// Each invocation runs the real binary against a scratch data directory.
/// The ephemeral tier lives and dies with a process, so these tests assert
/// per-invocation behavior and the durable surfaces (audit, quota, stats).
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn engramctl(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("engramctl").unwrap();
    cmd.arg("--data-dir").arg(dir.path());
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("engramctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("recall"))
        .stdout(predicate::str::contains("meditate"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("purge"))
        .stdout(predicate::str::contains("stats"));
}

#[test]
fn test_create_reports_stored_item() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["create", "alice", "prefers dark roast", "--id", "note-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"))
        .stdout(predicate::str::contains("Stored: alice/note-1"))
        .stdout(predicate::str::contains("ephemeral"));
}

#[test]
fn test_create_warns_on_unconsented_sensitive() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["create", "alice", "ssh fingerprint", "--sensitive"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "will never leave the ephemeral tier",
        ));
}

#[test]
fn test_create_rejects_bad_importance() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["create", "alice", "note", "--importance", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to store memory"));
}

#[test]
fn test_get_missing_item_exits_one() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["get", "alice", "nothing"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Item not found: alice/nothing"));
}

#[test]
fn test_list_empty_owner() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["list", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No items for owner 'alice'"));
}

#[test]
fn test_audit_of_unknown_item_is_empty() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["audit", "nothing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No audit entries found"));
}

#[test]
fn test_created_item_leaves_durable_audit_trail() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["create", "alice", "short note", "--id", "traced"])
        .assert()
        .success();

    // The ledger survives the first process even though the payload
    // does not.
    engramctl(&dir)
        .args(["audit", "traced"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Audit trail for 'traced':"))
        .stdout(predicate::str::contains("create"));
}

#[test]
fn test_purge_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["purge", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Re-run with --yes to confirm"));

    engramctl(&dir)
        .args(["purge", "alice", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Items removed: 0"));
}

#[test]
fn test_consent_rejects_unknown_action() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["consent", "alice", "item", "maybe"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid consent action 'maybe'"));
}

#[test]
fn test_quota_shows_all_tiers_and_sets_limits() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["quota", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("short"))
        .stdout(predicate::str::contains("long"))
        .stdout(predicate::str::contains("object"));

    engramctl(&dir)
        .args(["quota", "alice", "--tier", "long", "--limit", "1024"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Limit for alice/long set to 1.0 KiB"));
}

#[test]
fn test_quota_limit_requires_tier() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .args(["quota", "alice", "--limit", "1024"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--limit requires --tier"));
}

#[test]
fn test_stats_runs_on_fresh_store() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Engram Status"))
        .stdout(predicate::str::contains("ephemeral: 0"))
        .stdout(predicate::str::contains("Operations since start:"));
}

#[test]
fn test_meditate_reports_pass() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .arg("meditate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Meditation pass:"))
        .stdout(predicate::str::contains("Scanned: 0"));
}

#[test]
fn test_sweep_reports_count() {
    let dir = TempDir::new().unwrap();
    engramctl(&dir)
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 expired items pruned"));
}
