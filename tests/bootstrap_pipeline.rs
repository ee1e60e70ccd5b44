//! End-to-end bootstrap against a local release mirror.
//!
//! The mirror is a mockito server; mounts are simulated and chroot commands
//! recorded, so the whole pipeline runs unprivileged.

mod helpers;

use std::fs;
use std::path::PathBuf;

use alpiso::config::{BuildConfig, Settings};
use alpiso::error::{BuildError, Stage};
use alpiso::initramfs::InitScript;
use alpiso::rootfs::{Bootstrapper, RootfsHandle};
use alpiso::sbom;
use helpers::{event_log, minirootfs_tarball, read_initramfs, RecordingRunner, SimulatedMounts};
use mockito::{Mock, ServerGuard};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const INDEX_PATH: &str = "/v3.19/releases/x86_64/latest-releases.yaml";
const TARBALL: &str = "alpine-minirootfs-3.19.1-x86_64.tar.gz";

struct Mirror {
    server: ServerGuard,
    index: Mock,
    tarball: Mock,
}

fn mirror(checksum: Option<String>) -> Mirror {
    let mut server = mockito::Server::new();
    let body = minirootfs_tarball();
    let sha = checksum.unwrap_or_else(|| format!("{:x}", Sha256::digest(&body)));
    let index_body = format!(
        "- title: Mini root filesystem\n  flavor: alpine-minirootfs\n  version: 3.19.1\n  file: {}\n  sha256: {}\n",
        TARBALL, sha
    );
    let index = server
        .mock("GET", INDEX_PATH)
        .with_status(200)
        .with_body(index_body)
        .create();
    let tarball = server
        .mock("GET", format!("/v3.19/releases/x86_64/{}", TARBALL).as_str())
        .with_status(200)
        .with_body(body)
        .create();
    Mirror {
        server,
        index,
        tarball,
    }
}

fn settings(url: &str) -> Settings {
    let url = url.to_string();
    Settings::from_lookup(move |key| match key {
        "ALPISO_MIRROR" => Some(url.clone()),
        "ALPISO_BRANCH" => Some("v3.19".to_string()),
        _ => None,
    })
}

struct Host {
    temp: TempDir,
    resolv: PathBuf,
    dev: PathBuf,
}

fn host() -> Host {
    let temp = TempDir::new().unwrap();
    let resolv = temp.path().join("resolv.conf");
    fs::write(&resolv, "nameserver 192.0.2.53\n").unwrap();
    let dev = temp.path().join("host-dev");
    fs::create_dir_all(&dev).unwrap();
    Host { temp, resolv, dev }
}

fn position(events: &[String], prefix: &str) -> usize {
    events
        .iter()
        .position(|e| e.starts_with(prefix))
        .unwrap_or_else(|| panic!("no event starting with {prefix:?} in {events:#?}"))
}

#[test]
fn test_bootstrap_end_to_end() {
    let m = mirror(None);
    let settings = settings(&m.server.url());
    let host = host();
    let events = event_log();
    let sim = SimulatedMounts::new(events.clone());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(events.clone());

    let handle = RootfsHandle::create(&host.temp.path().join("work"), "e2e", "x86_64").unwrap();
    let report = Bootstrapper::new(&settings, &mounts, &runner)
        .with_host_resolv(&host.resolv)
        .with_host_dev(&host.dev)
        .run(&handle)
        .unwrap();

    m.index.assert();
    m.tarball.assert();

    let root = handle.root();
    assert_eq!(report.release.file, TARBALL);
    assert_eq!(report.kernel_version, "6.6.14-0-lts");
    assert_eq!(report.initramfs, root.join("boot/initramfs-lts"));
    assert!(report.patch.replaced_entrypoint);

    assert_eq!(
        fs::read_to_string(root.join("etc/alpine-release")).unwrap(),
        "3.19.1\n"
    );
    assert_eq!(
        fs::read_to_string(root.join("etc/resolv.conf")).unwrap(),
        "nameserver 192.0.2.53\n"
    );
    let repos = fs::read_to_string(root.join("etc/apk/repositories")).unwrap();
    assert_eq!(
        repos,
        format!(
            "{url}/v3.19/main\n{url}/v3.19/community\n",
            url = m.server.url()
        )
    );
    assert!(root.join("etc/mkinitfs/mkinitfs.conf").exists());

    let init = read_initramfs(&report.initramfs)
        .into_iter()
        .find(|e| e.path == "init")
        .unwrap();
    assert_eq!(init.data, InitScript::get().as_bytes());

    // Mounts stay up for provisioning.
    assert_eq!(sim.live().len(), 3);
}

#[test]
fn test_mounts_precede_package_installation() {
    let m = mirror(None);
    let settings = settings(&m.server.url());
    let host = host();
    let events = event_log();
    let sim = SimulatedMounts::new(events.clone());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(events.clone());

    let handle = RootfsHandle::create(host.temp.path(), "order", "x86_64").unwrap();
    Bootstrapper::new(&settings, &mounts, &runner)
        .with_host_resolv(&host.resolv)
        .with_host_dev(&host.dev)
        .run(&handle)
        .unwrap();

    let events = events.borrow().clone();
    let proc_mount = position(&events, "mount proc");
    let sys_mount = position(&events, "mount sysfs");
    let dev_bind = position(&events, "bind");
    let update = position(&events, "apk update");
    let add = position(&events, "apk add --no-cache alpine-base");
    let mkinitfs = position(&events, "mkinitfs 6.6.14-0-lts");

    assert!(proc_mount < sys_mount && sys_mount < dev_bind);
    assert!(dev_bind < update && update < add && add < mkinitfs);
}

#[test]
fn test_checksum_mismatch_fails_download_stage() {
    let m = mirror(Some("00".repeat(32)));
    let settings = settings(&m.server.url());
    let host = host();
    let sim = SimulatedMounts::new(event_log());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(event_log());

    let handle = RootfsHandle::create(host.temp.path(), "badsum", "x86_64").unwrap();
    let err = Bootstrapper::new(&settings, &mounts, &runner)
        .with_host_resolv(&host.resolv)
        .with_host_dev(&host.dev)
        .run(&handle)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Download));
    assert!(matches!(err.root_cause(), BuildError::Download(_)));
    assert!(sim.live().is_empty());
}

#[test]
fn test_failed_install_is_tagged_and_leaves_mounts_for_teardown() {
    let m = mirror(None);
    let settings = settings(&m.server.url());
    let host = host();
    let events = event_log();
    let sim = SimulatedMounts::new(events.clone());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(events.clone()).failing_on("apk add");

    let handle = RootfsHandle::create(host.temp.path(), "fail", "x86_64").unwrap();
    let err = Bootstrapper::new(&settings, &mounts, &runner)
        .with_host_resolv(&host.resolv)
        .with_host_dev(&host.dev)
        .run(&handle)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::InstallBase));
    assert!(matches!(
        err.root_cause(),
        BuildError::Provisioning { .. }
    ));
    assert!(!runner.commands().iter().any(|c| c.starts_with("mkinitfs")));

    // The caller's teardown releases everything and removes the tree.
    assert_eq!(sim.live().len(), 3);
    let work_dir = handle.work_dir().to_path_buf();
    handle.destroy(&mounts).unwrap();
    assert!(sim.live().is_empty());
    assert!(!work_dir.exists());
    assert!(host.dev.exists());
}

#[test]
fn test_unsupported_arch_fails_first_stage() {
    let host = host();
    let settings = settings("http://127.0.0.1:9");
    let sim = SimulatedMounts::new(event_log());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(event_log());

    let handle = RootfsHandle::create(host.temp.path(), "arch", "m68k").unwrap();
    let err = Bootstrapper::new(&settings, &mounts, &runner)
        .run(&handle)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::ResolveArch));
}

#[test]
fn test_provision_and_sbom() {
    let m = mirror(None);
    let settings = settings(&m.server.url());
    let host = host();
    let events = event_log();
    let sim = SimulatedMounts::new(events.clone());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(events.clone());
    let config = BuildConfig::parse(
        r#"
version: "2.0"
name: demo
distro:
  base: alpine
packages: [vim]
users:
  - name: root
    password: toor
  - name: alice
    password: secret
services:
  enable: [sshd]
"#,
    )
    .unwrap();

    let handle = RootfsHandle::create(host.temp.path(), "prov", "x86_64").unwrap();
    let bootstrapper = Bootstrapper::new(&settings, &mounts, &runner)
        .with_host_resolv(&host.resolv)
        .with_host_dev(&host.dev);
    bootstrapper.run(&handle).unwrap();
    events.borrow_mut().clear();

    bootstrapper.provision(&handle, &config).unwrap();
    assert_eq!(
        runner.commands(),
        vec![
            "apk add --no-cache vim",
            "chpasswd",
            "adduser -D alice",
            "chpasswd",
            "rc-update add sshd default",
        ]
    );

    let out = host.temp.path().join("demo-sbom.spdx.json");
    let count = sbom::generate(&runner, handle.root(), "demo", "2.0", &out).unwrap();
    assert_eq!(count, 3);
    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc["packages"][2]["name"], "busybox");
    assert_eq!(doc["packages"][2]["versionInfo"], "1.36.1-r15");
}

#[test]
fn test_provision_requires_live_chroot_mounts() {
    let settings = settings("http://127.0.0.1:9");
    let host = host();
    let events = event_log();
    let sim = SimulatedMounts::new(events.clone());
    let mounts = sim.manager();
    let runner = RecordingRunner::new(events.clone());
    let config = BuildConfig::parse(
        r#"
version: "1.0"
name: bare
distro:
  base: alpine
packages: [vim]
users:
  - name: root
    password: toor
"#,
    )
    .unwrap();

    let handle = RootfsHandle::create(host.temp.path(), "bare", "x86_64").unwrap();
    sim.add(handle.root().join("proc"), alpiso::mount::MountKind::Virtual);

    let err = Bootstrapper::new(&settings, &mounts, &runner)
        .provision(&handle, &config)
        .unwrap_err();

    match err {
        BuildError::Mount { target, .. } => assert_eq!(target, handle.root().join("sys")),
        other => panic!("expected a mount error, got {other}"),
    }
    assert!(runner.commands().is_empty());
}
