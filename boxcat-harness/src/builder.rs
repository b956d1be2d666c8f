//! Build-once support for the server under test.

use boxcat_core::config::{BuildConfig, ServerConfig};
use boxcat_core::error::{BoxcatError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::info;

/// Process-wide build state used by [`crate::harness`].
pub static SERVER_BUILD: BuildOnce = BuildOnce::new();

/// Runs a build command at most once. A failed build is not remembered, so
/// the next caller tries again.
pub struct BuildOnce {
    built: OnceCell<()>,
    runs: AtomicUsize,
}

impl BuildOnce {
    pub const fn new() -> Self {
        Self {
            built: OnceCell::const_new(),
            runs: AtomicUsize::new(0),
        }
    }

    /// Build the server unless a previous call already succeeded. With no
    /// build configured this is a no-op.
    pub async fn ensure(&self, server: &ServerConfig, build: Option<&BuildConfig>) -> Result<()> {
        let Some(build) = build else {
            return Ok(());
        };

        self.built
            .get_or_try_init(|| async {
                self.runs.fetch_add(1, Ordering::SeqCst);
                run_build(server, build).await
            })
            .await?;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built.initialized()
    }

    /// How many times the build command has been started.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Default for BuildOnce {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_build(server: &ServerConfig, build: &BuildConfig) -> Result<()> {
    info!(
        "Running {} {:?} in [{}]...",
        build.program, build.args, server.directory
    );

    let output = Command::new(&build.program)
        .args(&build.args)
        .current_dir(&server.directory)
        .output()
        .await
        .map_err(|e| BoxcatError::Build(format!("error running {}: {}", build.program, e)))?;

    if !output.status.success() {
        return Err(BoxcatError::Build(format!(
            "{} {:?} failed: {}: {}{}",
            build.program,
            build.args,
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    Ok(())
}
