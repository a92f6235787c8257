use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .try_init();
    });
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> &'static str {
    match name {
        "fio_randrw_final.json" => include_str!("../fixtures/fio_randrw_final.json"),
        "fio_seq_read_stream.json" => include_str!("../fixtures/fio_seq_read_stream.json"),
        "fio_noisy_output.txt" => include_str!("../fixtures/fio_noisy_output.txt"),
        "fio_fake_job.json" => include_str!("../fixtures/fio_fake_job.json"),
        other => panic!("unknown fixture: {other}"),
    }
}

/// What a fake fio does when asked to run a benchmark job.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum FakeJob {
    /// Print two status documents and exit 0.
    Complete,
    /// Print one status document, then hang.
    Hang,
    /// Print nothing and hang.
    Silent,
    /// Complain on stderr and exit 1.
    Fail,
    /// Print one status document, then die by SIGKILL.
    Crash,
}

#[allow(dead_code)]
impl FakeJob {
    fn script(self) -> String {
        let doc = fixture("fio_fake_job.json");
        match self {
            Self::Complete => format!(
                "cat <<'JSON'\n{doc}JSON\nsleep 0.1\ncat <<'JSON'\n{doc}JSON\nexit 0\n"
            ),
            Self::Hang => format!("cat <<'JSON'\n{doc}JSON\nexec sleep 60\n"),
            Self::Silent => "exec sleep 60\n".to_string(),
            Self::Fail => "echo 'fio: failed to open file' >&2\nexit 1\n".to_string(),
            Self::Crash => format!("cat <<'JSON'\n{doc}JSON\nkill -9 $$\n"),
        }
    }
}

/// A fake `fio` executable in its own temp directory.
///
/// Every invocation appends its arguments to `invocations.log` and its pid
/// to `pids.log`. Benchmark job `n` (zero-based, prepare excluded) behaves
/// as `jobs[n]`, or as the last entry once the list runs out.
#[allow(dead_code)]
pub struct FakeFio {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
}

#[allow(dead_code)]
impl FakeFio {
    pub fn new(jobs: &[FakeJob]) -> Self {
        Self::with_prepare(jobs, true)
    }

    pub fn with_prepare(jobs: &[FakeJob], prepare_ok: bool) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fio");

        let mut script = String::from(
            r#"#!/bin/sh
here=$(dirname "$0")
prepare=
file=
for arg in "$@"; do
  case "$arg" in
    --version) echo "fio-3.36"; exit 0 ;;
    --create_only=1) prepare=1 ;;
    --filename=*) file="${arg#--filename=}" ;;
  esac
done
echo "$*" >> "$here/invocations.log"
echo "$$" >> "$here/pids.log"
if [ -n "$prepare" ]; then
"#,
        );
        if prepare_ok {
            script.push_str("  : > \"$file\"\n  exit 0\n");
        } else {
            script.push_str("  echo 'fio: no space left on device' >&2\n  exit 1\n");
        }
        script.push_str("fi\n");
        script.push_str(
            "n=$(grep -vc -- '--create_only=1' \"$here/invocations.log\")\n",
        );
        script.push_str("case \"$n\" in\n");
        for (i, job) in jobs.iter().enumerate() {
            script.push_str(&format!("  {})\n{}  ;;\n", i + 1, job.script()));
        }
        let fallback = jobs.last().copied().unwrap_or(FakeJob::Complete);
        script.push_str(&format!("  *)\n{}  ;;\nesac\n", fallback.script()));

        std::fs::write(&path, script).expect("write fake fio");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake fio");

        Self { dir, path }
    }

    /// Every recorded invocation's argument line.
    pub fn invocations(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("invocations.log"))
    }

    /// Benchmark invocations only.
    pub fn job_invocations(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|line| !line.contains("--create_only=1"))
            .collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        read_lines(&self.dir.path().join("pids.log"))
            .iter()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }
}

#[allow(dead_code)]
fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Whether `pid` still names a live, unreaped process.
#[allow(dead_code)]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
