use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use corral::container::{ContainerStatus, Factory};
use corral::error::LibcorralError;
use corral::process::{LaunchContext, LaunchError, Process, ProcessLauncher};
use corral::registry::Registry;
use corral::spec::Spec;
use corral::translate::{create_config, CreateOpts};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use procfs::process::ProcState;
use serial_test::serial;
use tempfile::tempdir;

const BUNDLE_CONFIG: &str = r#"{
    "root": { "path": "rootfs" },
    "hostname": "lifecycle",
    "annotations": { "org.example.owner": "tests" },
    "process": { "args": ["sleep", "30"], "cwd": "/", "env": ["PATH=/bin"] },
    "mounts": [
        { "destination": "/proc", "type": "proc", "source": "proc" },
        { "destination": "/data", "type": "none", "source": "data", "options": ["rbind", "ro"] }
    ],
    "linux": {
        "namespaces": [{ "type": "pid" }, { "type": "mount" }, { "type": "network" }],
        "resources": { "pids": { "limit": 32 } }
    }
}"#;

fn prepare_bundle(bundle: &Path) -> Result<()> {
    fs::create_dir(bundle.join("rootfs"))?;
    fs::write(bundle.join("config.json"), BUNDLE_CONFIG)?;
    Ok(())
}

fn prepare_cgroup(cgroup_root: &Path, id: &str) -> Result<()> {
    fs::write(cgroup_root.join("cgroup.controllers"), "")?;
    fs::write(cgroup_root.join("cgroup.subtree_control"), "")?;
    let cgroup = cgroup_root.join(id);
    fs::create_dir_all(&cgroup)?;
    for (file, content) in [
        ("cgroup.procs", ""),
        ("cgroup.freeze", "0"),
        ("cgroup.events", "populated 1\nfrozen 1\n"),
        ("pids.max", ""),
    ] {
        fs::write(cgroup.join(file), content)?;
    }
    Ok(())
}

/// Runs the process on the host, writing to the exec fifo before executing it.
#[derive(Default)]
struct HostLauncher {
    children: Mutex<Vec<Child>>,
}

impl ProcessLauncher for HostLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Pid, LaunchError> {
        if ctx.process.args.is_empty() {
            return Err(LaunchError::NoCommand);
        }
        let child = Command::new("sh")
            .arg("-c")
            .arg(r#"echo 0 > "$0"; exec "$@""#)
            .arg(ctx.exec_fifo)
            .args(&ctx.process.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| LaunchError::Spawn {
                command: ctx.process.command(),
                source: err,
            })?;
        let pid = Pid::from_raw(child.id() as i32);
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(child);
        Ok(pid)
    }
}

impl Drop for HostLauncher {
    fn drop(&mut self) {
        if let Ok(children) = self.children.get_mut() {
            for child in children {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn exited(pid: Pid) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let state = procfs::process::Process::new(pid.as_raw())
            .and_then(|p| p.stat())
            .and_then(|stat| stat.state());
        if matches!(state, Err(_) | Ok(ProcState::Zombie) | Ok(ProcState::Dead)) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
#[serial]
fn create_start_pause_resume_destroy() -> Result<()> {
    let tmp = tempdir()?;
    let bundle = tmp.path().join("bundle");
    fs::create_dir(&bundle)?;
    prepare_bundle(&bundle)?;
    let cgroup_root = tmp.path().join("cgroup");
    fs::create_dir(&cgroup_root)?;
    prepare_cgroup(&cgroup_root, "ct1")?;

    let spec = Spec::load(bundle.join("config.json"))?;
    let opts = CreateOpts {
        bundle: Some(bundle.clone()),
        ..CreateOpts::new("ct1", &spec)
    };
    let config = create_config(&Registry::default(), &opts)?;
    assert_eq!(config.rootfs, bundle.join("rootfs"));
    assert_eq!(config.bundle(), bundle.to_str());
    assert_eq!(config.cgroups.resources.pids_limit, Some(32));

    let launcher = Arc::new(HostLauncher::default());
    let factory =
        Factory::new(tmp.path().join("state"), launcher.clone()).with_cgroup_root(&cgroup_root);
    let mut container = factory.create("ct1", config)?;
    assert_eq!(container.status(), ContainerStatus::Created);
    assert_eq!(
        container.state().annotations.get("org.example.owner"),
        Some(&"tests".to_owned())
    );

    let process = spec.process.as_ref().map(|p| Process::from_spec(p, true));
    container.start(process.unwrap_or_default())?;
    assert_eq!(container.status(), ContainerStatus::Running);
    let pid = container.pid().expect("init pid");
    assert_eq!(container.processes()?, vec![pid]);
    assert_eq!(fs::read_to_string(cgroup_root.join("ct1/pids.max"))?, "32");

    container.pause()?;
    assert_eq!(factory.load("ct1")?.status(), ContainerStatus::Paused);
    let err = container.destroy().unwrap_err();
    assert!(err.is_incorrect_status());

    container.resume()?;
    assert_eq!(container.status(), ContainerStatus::Running);

    container.signal(Signal::SIGKILL, false)?;
    assert!(exited(pid));

    let mut container = factory.load("ct1")?;
    assert_eq!(container.status(), ContainerStatus::Stopped);
    let err = container.pause().unwrap_err();
    assert!(matches!(
        err,
        LibcorralError::IncorrectStatus {
            current: ContainerStatus::Stopped,
            ..
        }
    ));

    fs::remove_dir_all(cgroup_root.join("ct1"))?;
    container.destroy()?;
    container.destroy()?;
    assert!(factory.load("ct1").unwrap_err().is_not_found());
    Ok(())
}

#[test]
#[serial]
fn create_rejects_duplicates_and_bad_ids() -> Result<()> {
    let tmp = tempdir()?;
    prepare_bundle(tmp.path())?;
    let spec = Spec::load(tmp.path().join("config.json"))?;
    let opts = CreateOpts {
        bundle: Some(tmp.path().to_owned()),
        ..CreateOpts::new("ct1", &spec)
    };
    let config = create_config(&Registry::default(), &opts)?;

    let factory = Factory::new(tmp.path().join("state"), Arc::new(HostLauncher::default()));
    factory.create("ct1", config.clone())?;
    assert!(matches!(
        factory.create("ct1", config.clone()),
        Err(LibcorralError::Exist(_))
    ));
    assert!(matches!(
        factory.create("ct/1", config),
        Err(LibcorralError::InvalidId(_))
    ));
    Ok(())
}
