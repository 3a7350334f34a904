//! Process-level behavior of the two tools: setup-failure exit codes and
//! argument parsing. None of these require GPU hardware.

use assert_cmd::Command;

#[test]
fn watch_exits_1_when_the_device_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("renderD128");

    Command::cargo_bin("etna-watch")
        .unwrap()
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("failed to open device node"));
}

#[test]
fn yuv_test_exits_1_when_the_device_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("renderD128");

    Command::cargo_bin("etna-yuv-test")
        .unwrap()
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("failed to open device node"));
}

#[test]
fn watch_exits_2_when_the_node_does_not_speak_drm() {
    // A regular file opens fine but rejects the version ioctl, so the
    // failure surfaces at device-handle creation.
    let file = tempfile::NamedTempFile::new().unwrap();

    Command::cargo_bin("etna-watch")
        .unwrap()
        .arg(file.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicates::str::contains("version query failed"));
}

#[test]
fn both_tools_describe_themselves() {
    Command::cargo_bin("etna-watch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("debug-counter"));

    Command::cargo_bin("etna-yuv-test")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("YUV"));
}
