use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        ws.tally().args(["init"]).assert().success();
        ws
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("data").join("tally.db")
    }

    /// `tally --db <db>` with HOME pointed at the temp dir.
    fn tally(&self) -> Command {
        let mut cmd = Command::cargo_bin("tally").unwrap();
        cmd.env("HOME", self.dir.path())
            .env_remove("OPENAI_API_KEY")
            .env_remove("RUST_LOG")
            .arg("--db")
            .arg(self.db());
        cmd
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

const STANDARD_CSV: &str = "id,transaction_date,payment_date,description,amount,account\n\
2025-03-001,2025-02-20,2025-03-15,IFOOD 02/10 SAO PAULO,-45.90,itau_cc\n\
2025-03-001,2025-02-20,2025-03-15,IFOOD 02/10 SAO PAULO,-45.90,itau_cc\n\
2025-03-002,2025-02-21,2025-03-15,UBER TRIP,-12.00,itau_cc\n\
2025-03-003,2025-02-22,2025-03-15,UBER TRIP SP,-20.00,itau_cc\n";

fn import(ws: &Workspace, path: &Path) -> assert_cmd::assert::Assert {
    ws.tally().arg("import").arg(path).assert()
}

#[test]
fn test_init_creates_database() {
    let ws = Workspace::new();
    assert!(ws.db().exists());
    ws.tally()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transactions:   0"));
}

#[test]
fn test_import_twice_is_idempotent() {
    let ws = Workspace::new();
    let csv = ws.write("itau.csv", STANDARD_CSV);

    import(&ws, &csv)
        .success()
        .stdout(predicate::str::contains("3 inserted, 1 skipped"));
    import(&ws, &csv)
        .success()
        .stdout(predicate::str::contains("0 inserted, 4 skipped"));

    ws.tally()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transactions:   3"))
        .stdout(predicate::str::contains("Uncategorized:  3"))
        .stdout(predicate::str::contains("itau_cc"));
}

#[test]
fn test_import_currency_option() {
    let ws = Workspace::new();
    let csv = ws.write("itau.csv", STANDARD_CSV);
    ws.tally()
        .args(["import", "--currency", "usd"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 inserted"));
    let conn = rusqlite::Connection::open(ws.db()).unwrap();
    let currencies: Vec<String> = conn
        .prepare("SELECT DISTINCT currency FROM transactions")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(currencies, vec!["USD".to_string()]);
}

#[test]
fn test_import_reports_bad_rows() {
    let ws = Workspace::new();
    let csv = ws.write(
        "itau.csv",
        "id,transaction_date,payment_date,description,amount,account\n\
         2025-03-001,2025-02-20,2025-03-15,IFOOD,-45.90,itau_cc\n\
         2025-03-002,2025-02-21,2025-03-15,UBER,abc,itau_cc\n",
    );
    import(&ws, &csv)
        .success()
        .stdout(predicate::str::contains("1 inserted, 0 skipped (duplicates), 1 failed"))
        .stdout(predicate::str::contains("row 2"));
}

#[test]
fn test_unknown_source_fails() {
    let ws = Workspace::new();
    let csv = ws.write("bank.csv", STANDARD_CSV.replace("itau_cc", "").as_str());
    import(&ws, &csv)
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_set_pending_and_search_tier() {
    let ws = Workspace::new();
    let csv = ws.write("itau.csv", STANDARD_CSV);
    import(&ws, &csv).success();

    ws.tally()
        .args(["category", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ifood sao paulo"))
        .stdout(predicate::str::contains("3 transactions in 3 groups"));

    ws.tally()
        .args(["category", "set", "UBER TRIP", "Transport"])
        .assert()
        .success()
        .stdout(predicate::str::contains("'uber trip'"))
        .stdout(predicate::str::contains("(1 transactions)"));

    ws.tally()
        .args(["category", "run", "--max-tier", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 groups: 0 exact, 1 search, 0 AI"))
        .stdout(predicate::str::contains("1 unresolved"));

    ws.tally()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Uncategorized:  1"));
}

#[test]
fn test_cache_export_import_and_apply() {
    let source = Workspace::new();
    let csv = source.write("itau.csv", STANDARD_CSV);
    import(&source, &csv).success();
    source
        .tally()
        .args(["category", "set", "IFOOD SAO PAULO", "Food"])
        .assert()
        .success();

    let export = source.dir.path().join("cache.csv");
    source
        .tally()
        .args(["category", "cache", "export"])
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 cache entries written"));
    let exported = std::fs::read_to_string(&export).unwrap();
    assert!(exported.contains("ifood sao paulo"));
    assert!(exported.contains("Food"));

    let target = Workspace::new();
    let csv = target.write("itau.csv", STANDARD_CSV);
    import(&target, &csv).success();
    target
        .tally()
        .args(["category", "cache", "import"])
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 cache entries imported"));
    target
        .tally()
        .args(["category", "apply"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 transactions categorized"));
}

#[test]
fn test_recanon_and_conflicts_on_clean_store() {
    let ws = Workspace::new();
    let csv = ws.write("itau.csv", STANDARD_CSV);
    import(&ws, &csv).success();
    ws.tally()
        .args(["category", "recanon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 statements re-keyed"));
    ws.tally()
        .args(["category", "conflicts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cache conflicts."));
    ws.tally()
        .args(["category", "resolve", "ifood sao paulo", "Food"])
        .assert()
        .failure();
}

#[test]
fn test_max_tier_out_of_range() {
    let ws = Workspace::new();
    ws.tally()
        .args(["category", "run", "--max-tier", "0"])
        .assert()
        .failure();
}
