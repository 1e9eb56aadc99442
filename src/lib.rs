// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 RootGuard

//! RootGuard Security Check - Rust Implementation
//!
//! Native backend for the RootGuard hybrid-app plugin. A single call,
//! `checkSecurity`, decides whether the running Android device shows signs of
//! root access or of Frida instrumentation and reports the verdict as 0/1.
//! Detection is an ordered OR-chain of independent probes; the first positive
//! probe decides. Probe errors and timeouts are treated as compromised.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use jni::objects::JClass;
use jni::sys::{jint, jstring};
use jni::JNIEnv;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

#[cfg(target_os = "android")]
use android_logger::Config;
#[cfg(target_os = "android")]
use log::LevelFilter;

/// Security check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityCheckResult {
    pub is_compromised: bool,
    pub detection_methods: Vec<String>,
}

/// Probe failure. Under the fail-safe policy every variant is folded into a
/// positive detection at the aggregation seam; nothing here reaches the caller.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{program}` did not finish within {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u64 },
    #[error("probe i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Upper bound for every spawned probe process and TCP connect attempt.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Wall-clock budget for the /proc walk so a huge or slow procfs cannot
/// stall the check.
const PROC_SCAN_BUDGET: Duration = Duration::from_secs(5);

/// Common SU binary paths
const SU_PATHS: &[&str] = &[
    "/data/local/su",
    "/data/local/bin/su",
    "/data/local/xbin/su",
    "/sbin/su",
    "/su/bin/su",
    "/system/app/Superuser.apk",
    "/system/bin/su",
    "/system/bin/.ext/su",
    "/system/bin/failsafe/su",
    "/system/sd/xbin/su",
    "/system/su",
    "/system/usr/we-need-root/su",
    "/system/xbin/su",
    "/cache/su",
    "/data/su",
    "/dev/su",
    "/product/bin/su",
    "/apex/com.android.runtime/bin/su",
    "/apex/com.android.art/bin/su",
    "/system_ext/bin/su",
    "/odm/bin/su",
    "/vendor/bin/su",
    "/vendor/xbin/su",
];

/// Magisk paths
const MAGISK_PATHS: &[&str] = &[
    "/data/adb/magisk",
    "/sbin/.magisk",
    "/sbin/magisk",
    "/sbin/magiskhide",
    "/system/bin/magisk",
    "/data/adb/modules",
    "/cache/magisk.log",
    "/data/magisk/magisk.db",
];

/// Frida server paths
const FRIDA_PATHS: &[&str] = &[
    "/data/local/tmp/frida-server",
    "/data/local/tmp/re.frida.server",
    "/system/bin/frida-server",
    "/system/xbin/frida-server",
];

/// Default frida-server listening ports
const FRIDA_PORTS: &[u16] = &[27042, 27043];

/// Instrumentation markers in /proc/self/maps (frida-agent, frida-gadget,
/// GumJS script runtime)
const MAPS_MARKERS: &[&str] = &["frida", "gadget", "gum-js"];

// ============================================================================
// Probe Helpers
// ============================================================================

/// Return the first path from the list that exists on disk
fn first_existing_path<'a>(paths: &[&'a str]) -> Option<&'a str> {
    paths.iter().copied().find(|path| Path::new(path).exists())
}

/// Run an external probe command, bounded by PROBE_TIMEOUT.
///
/// The child is killed if the timeout elapses (kill_on_drop). Returns the
/// collected stdout as a lossy UTF-8 string.
async fn run_probe_command(program: &str, args: &[&str]) -> Result<String, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProbeError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = timeout(PROBE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ProbeError::Timeout {
            program: program.to_string(),
            timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
        })??;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Probe a local TCP port. Refused connections and timeouts are a negative
/// result, not an error.
async fn probe_tcp_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Scan memory-map content for instrumentation markers
fn find_maps_marker(maps: &str) -> Option<&'static str> {
    for line in maps.lines() {
        let line = line.to_lowercase();
        if let Some(marker) = MAPS_MARKERS.iter().copied().find(|m| line.contains(*m)) {
            return Some(marker);
        }
    }
    None
}

/// Check whether the /system mount line lacks the `ro` option.
///
/// A writable /system means the partition was remounted, which on a stock
/// device only happens with root.
fn system_partition_writable(mounts: &str) -> bool {
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[1] == "/system" {
            return !fields[3].split(',').any(|opt| opt == "ro");
        }
    }
    false
}

/// Check whether a /proc cmdline names a frida component
fn cmdline_names_frida(cmdline: &str) -> bool {
    cmdline.to_lowercase().contains("frida")
}

/// Check whether getprop output mentions frida
fn props_mention_frida(props: &str) -> bool {
    props.to_lowercase().contains("frida")
}

/// Walk the process table looking for a frida-server (or frida-agent)
/// process. The walk is bounded by PROC_SCAN_BUDGET.
///
/// A process table that cannot be enumerated at all is a probe error;
/// individual unreadable entries are normal and skipped.
fn scan_proc_for_frida(proc_root: &str) -> Result<Option<String>, ProbeError> {
    let start_time = Instant::now();

    for entry in fs::read_dir(proc_root)? {
        if start_time.elapsed() > PROC_SCAN_BUDGET {
            break;
        }

        if let Ok(entry) = entry {
            let pid_dir = entry.path();
            if !pid_dir.is_dir() {
                continue;
            }

            // Only numeric directory names are PIDs
            let pid_str = pid_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if pid_str.is_empty() || pid_str.chars().any(|c| !c.is_ascii_digit()) {
                continue;
            }

            if let Ok(cmdline) = fs::read_to_string(pid_dir.join("cmdline")) {
                if cmdline_names_frida(&cmdline) {
                    return Ok(Some(format!("Frida process detected (pid={})", pid_str)));
                }
            }
        }
    }

    Ok(None)
}

/// Fold a probe error into a positive detection (fail-safe policy)
fn fail_safe(probe: &str, err: ProbeError) -> String {
    log::warn!(
        "{} probe failed, treating device as compromised: {}",
        probe,
        err
    );
    format!("{} probe failed ({})", probe, err)
}

// ============================================================================
// Root Detection
// ============================================================================

/// Run the root probes in order and return the first positive detection.
///
/// Order: known su/Superuser paths, Magisk artifacts, `which su`, /system
/// mount options. File-existence probes cannot fail; command and I/O errors
/// are folded into a positive result.
pub async fn detect_root() -> Option<String> {
    if let Some(path) = first_existing_path(SU_PATHS) {
        return Some(format!("SU binary found: {}", path));
    }

    if let Some(path) = first_existing_path(MAGISK_PATHS) {
        return Some(format!("Magisk artifact detected: {}", path));
    }

    match run_probe_command("which", &["su"]).await {
        Ok(output) if !output.trim().is_empty() => {
            return Some(format!("`which su` resolved to {}", output.trim()));
        }
        Ok(_) => {}
        Err(err) => return Some(fail_safe("which su", err)),
    }

    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => {
            if system_partition_writable(&mounts) {
                return Some("/system partition mounted writable".to_string());
            }
        }
        Err(err) => return Some(fail_safe("mount table", ProbeError::Io(err))),
    }

    None
}

// ============================================================================
// Frida Detection
// ============================================================================

/// Run the Frida probes in order and return the first positive detection.
///
/// Order: frida-server binaries on disk, default ports, /proc/self/maps
/// markers, running frida process, `getprop` output.
pub async fn detect_frida() -> Option<String> {
    if let Some(path) = first_existing_path(FRIDA_PATHS) {
        return Some(format!("Frida server binary found: {}", path));
    }

    for port in FRIDA_PORTS {
        if probe_tcp_port(*port).await {
            return Some(format!("Frida default port {} accepts connections", port));
        }
    }

    match fs::read_to_string("/proc/self/maps") {
        Ok(maps) => {
            if let Some(marker) = find_maps_marker(&maps) {
                return Some(format!("Instrumentation marker `{}` in memory maps", marker));
            }
        }
        Err(err) => return Some(fail_safe("memory maps", ProbeError::Io(err))),
    }

    match scan_proc_for_frida("/proc") {
        Ok(Some(method)) => return Some(method),
        Ok(None) => {}
        Err(err) => return Some(fail_safe("proc walk", err)),
    }

    match run_probe_command("getprop", &[]).await {
        Ok(props) => {
            if props_mention_frida(&props) {
                return Some("System properties mention frida".to_string());
            }
        }
        Err(err) => return Some(fail_safe("getprop", err)),
    }

    None
}

// ============================================================================
// Security Check Aggregation
// ============================================================================

/// Perform the full security check: compromised = root OR frida.
///
/// Frida detection is skipped entirely when root is already detected.
pub async fn check_security() -> SecurityCheckResult {
    if let Some(method) = detect_root().await {
        log::info!("Root detected: {}", method);
        return SecurityCheckResult {
            is_compromised: true,
            detection_methods: vec![method],
        };
    }

    if let Some(method) = detect_frida().await {
        log::info!("Frida detected: {}", method);
        return SecurityCheckResult {
            is_compromised: true,
            detection_methods: vec![method],
        };
    }

    SecurityCheckResult {
        is_compromised: false,
        detection_methods: Vec::new(),
    }
}

// ============================================================================
// JNI Bindings
// ============================================================================

/// Initialize logging for Android
#[cfg(target_os = "android")]
#[no_mangle]
pub extern "C" fn Java_com_example_rootguard_RootGuard_nativeInit(_env: JNIEnv, _class: JClass) {
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag("RootGuard"),
    );
}

#[cfg(not(target_os = "android"))]
#[no_mangle]
pub extern "C" fn Java_com_example_rootguard_RootGuard_nativeInit(_env: JNIEnv, _class: JClass) {
    // No-op for non-Android platforms
}

/// Check security - JNI entry point
///
/// Returns 1 when the device is compromised, 0 otherwise. All failure paths
/// are folded into the integer result; there is no separate error channel.
#[no_mangle]
pub extern "C" fn Java_com_example_rootguard_RootGuard_nativeCheckSecurity(
    _env: JNIEnv,
    _class: JClass,
) -> jint {
    // Create tokio runtime so blocking probes run off the caller's thread
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("failed to create runtime, reporting compromised: {}", err);
            return 1;
        }
    };

    let result = rt.block_on(check_security());

    if result.is_compromised {
        1
    } else {
        0
    }
}

/// Check security (detailed) - JNI entry point
///
/// Returns JSON string with SecurityCheckResult so the host app can log
/// which probe fired.
#[no_mangle]
pub extern "C" fn Java_com_example_rootguard_RootGuard_nativeCheckSecurityDetailed(
    env: JNIEnv,
    _class: JClass,
) -> jstring {
    const FAIL_SAFE_JSON: &str =
        r#"{"is_compromised":true,"detection_methods":["security check could not run"]}"#;

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => {
            return match env.new_string(FAIL_SAFE_JSON) {
                Ok(jstr) => jstr.into_raw(),
                Err(_) => std::ptr::null_mut(),
            };
        }
    };

    let result = rt.block_on(check_security());

    // Serialize to JSON
    match serde_json::to_string(&result) {
        Ok(json) => match env.new_string(&json) {
            Ok(jstr) => jstr.into_raw(),
            Err(_) => match env.new_string(FAIL_SAFE_JSON) {
                Ok(jstr) => jstr.into_raw(),
                Err(_) => std::ptr::null_mut(),
            },
        },
        Err(_) => match env.new_string(FAIL_SAFE_JSON) {
            Ok(jstr) => jstr.into_raw(),
            Err(_) => std::ptr::null_mut(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_existing_path_finds_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("su");
        fs::write(&present, b"").unwrap();
        let missing = dir.path().join("missing").join("su");

        let present_str = present.to_str().unwrap();
        let missing_str = missing.to_str().unwrap();
        let paths = [missing_str, present_str];

        assert_eq!(first_existing_path(&paths), Some(present_str));
    }

    #[test]
    fn test_first_existing_path_none_when_absent() {
        assert_eq!(first_existing_path(&["/nonexistent/rootguard/su"]), None);
    }

    #[test]
    fn test_maps_marker_detects_gadget() {
        let maps = "7a1c000000-7a1c200000 r-xp 00000000 fd:00 1234 \
                    /data/app/lib/arm64/libfrida-gadget.so\n";
        assert_eq!(find_maps_marker(maps), Some("frida"));

        let maps = "7a1c000000-7a1c200000 rw-p 00000000 00:00 0 [anon:gum-js-loop]\n";
        assert_eq!(find_maps_marker(maps), Some("gum-js"));
    }

    #[test]
    fn test_maps_marker_ignores_clean_maps() {
        let maps = "7a1c000000-7a1c200000 r-xp 00000000 fd:00 1234 /system/lib64/libc.so\n\
                    7a1d000000-7a1d100000 rw-p 00000000 00:00 0 [anon:dalvik-main space]\n";
        assert_eq!(find_maps_marker(maps), None);
    }

    #[test]
    fn test_system_partition_writable() {
        let ro = "/dev/block/dm-0 /system ext4 ro,seclabel,relatime 0 0\n";
        assert!(!system_partition_writable(ro));

        let rw = "/dev/block/dm-0 /system ext4 rw,seclabel,relatime 0 0\n";
        assert!(system_partition_writable(rw));

        // No /system line at all (non-Android host)
        let none = "proc /proc proc rw,nosuid,nodev,noexec 0 0\n";
        assert!(!system_partition_writable(none));
    }

    #[test]
    fn test_cmdline_names_frida() {
        assert!(cmdline_names_frida("frida-server\u{0}--listen\u{0}"));
        assert!(cmdline_names_frida("/data/local/tmp/frida-agent"));
        assert!(!cmdline_names_frida("com.example.app\u{0}"));
    }

    #[test]
    fn test_props_mention_frida() {
        let props = "[init.svc.frida-server]: [running]\n[ro.build.type]: [user]\n";
        assert!(props_mention_frida(props));

        let clean = "[ro.build.type]: [user]\n[ro.product.model]: [Pixel 8]\n";
        assert!(!props_mention_frida(clean));
    }

    #[test]
    fn test_scan_proc_detects_frida_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("4242");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(pid_dir.join("cmdline"), "frida-server\u{0}--listen\u{0}").unwrap();

        let method = scan_proc_for_frida(dir.path().to_str().unwrap())
            .unwrap()
            .unwrap();
        assert!(method.contains("pid=4242"));
    }

    #[test]
    fn test_scan_proc_ignores_clean_process_table() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("4242");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(pid_dir.join("cmdline"), "com.example.app\u{0}").unwrap();
        // Non-numeric entries are skipped, not read
        fs::create_dir(dir.path().join("sys")).unwrap();

        assert_eq!(
            scan_proc_for_frida(dir.path().to_str().unwrap()).unwrap(),
            None
        );
    }

    #[test]
    fn test_scan_proc_unreadable_table_is_fail_safe() {
        let err = scan_proc_for_frida("/nonexistent/rootguard-proc").unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));

        // The aggregation seam turns the error into a positive detection
        let method = fail_safe("proc walk", err);
        assert!(method.contains("probe failed"));
    }

    #[test]
    fn test_fail_safe_reports_probe_failure() {
        let method = fail_safe(
            "getprop",
            ProbeError::Timeout {
                program: "getprop".to_string(),
                timeout_ms: 500,
            },
        );
        assert!(method.contains("getprop"));
        assert!(method.contains("probe failed"));
    }

    #[tokio::test]
    async fn test_run_probe_command_collects_stdout() {
        let output = run_probe_command("echo", &["rootguard"]).await.unwrap();
        assert!(output.contains("rootguard"));
    }

    #[tokio::test]
    async fn test_run_probe_command_spawn_failure() {
        let err = run_probe_command("/nonexistent/rootguard-probe", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_probe_command_timeout() {
        let err = run_probe_command("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_probe_tcp_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_tcp_port(port).await);

        drop(listener);
        assert!(!probe_tcp_port(port).await);
    }
}
