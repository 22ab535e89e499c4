use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn top_level_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("shelfsync");
    let out = cmd.arg("--help").assert().success().get_output().stdout.clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("sync"), "help missing sync subcommand");
    assert!(text.contains("upload"), "help missing upload subcommand");
    assert!(text.contains("status"), "help missing status subcommand");
    assert!(text.contains("auth"), "help missing auth subcommand");
}

#[test]
fn sync_help_documents_flags() {
    let mut cmd = cargo_bin_cmd!("shelfsync");
    let out = cmd
        .arg("sync")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("--dry-run"));
    assert!(text.contains("--force"));
    assert!(text.contains("--prune-missing"));
}

#[test]
fn auth_subcommands_present() {
    let mut cmd = cargo_bin_cmd!("shelfsync");
    let out = cmd
        .arg("auth")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("set"));
    assert!(text.contains("clear"));
}
