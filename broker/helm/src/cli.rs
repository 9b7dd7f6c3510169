use crate::{index, manifest};
use anyhow::{bail, Context, Result};
use chart_broker_core::{
    operation, ChartDeployer, ChartIndex, ChartRepository, ChartVersion, Params, Release,
    ReleaseRef,
};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, warn};

/// Release names are limited by the length of the labels helm derives from them.
const MAX_RELEASE_NAME: usize = 53;

/// Drives the `helm` binary against a single chart repository.
#[derive(Clone, Debug)]
pub struct Helm {
    bin: PathBuf,
    repo_name: String,
    repo_url: String,
}

/// The subset of `helm install --output json` the broker uses.
#[derive(Debug, Deserialize)]
struct InstalledRelease {
    name: String,
    namespace: String,
    #[serde(default)]
    manifest: String,
}

// === impl Helm ===

impl Helm {
    pub fn new(bin: impl Into<PathBuf>, repo_name: impl ToString, repo_url: impl ToString) -> Self {
        Self {
            bin: bin.into(),
            repo_name: repo_name.to_string(),
            repo_url: repo_url.to_string(),
        }
    }

    /// Registers the repository and downloads its index.
    pub async fn init(&self) -> Result<()> {
        self.run(
            &[
                "repo",
                "add",
                "--force-update",
                &self.repo_name,
                &self.repo_url,
            ],
            None,
        )
        .await
        .with_context(|| format!("failed to add chart repository {}", self.repo_url))?;
        self.refresh().await?;
        info!(repo = %self.repo_name, url = %self.repo_url, "Initialized chart repository");
        Ok(())
    }

    /// Downloads the latest repository index.
    pub async fn refresh(&self) -> Result<()> {
        self.run(&["repo", "update", &self.repo_name], None)
            .await
            .with_context(|| format!("failed to update chart repository {}", self.repo_name))?;
        Ok(())
    }

    async fn index_path(&self) -> Result<PathBuf> {
        let out = self.run(&["env", "HELM_REPOSITORY_CACHE"], None).await?;
        let cache = String::from_utf8_lossy(&out);
        let cache = cache.trim();
        if cache.is_empty() {
            bail!("helm did not report a repository cache");
        }
        Ok(Path::new(cache).join(format!("{}-index.yaml", self.repo_name)))
    }

    /// Runs helm, optionally feeding `stdin`, and returns its standard output.
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        debug!(bin = %self.bin.display(), ?args, "Running helm");
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to run {}", self.bin.display()))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.context("failed to write helm input")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for helm")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("helm {}: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl ChartRepository for Helm {
    async fn charts(&self) -> Result<ChartIndex> {
        let path = self.index_path().await?;
        let yaml = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        index::parse(&yaml).with_context(|| format!("failed to load {}", path.display()))
    }
}

#[async_trait::async_trait]
impl ChartDeployer for Helm {
    async fn deploy(&self, chart: &ChartVersion, namespace: &str, values: &Params) -> Result<Release> {
        let name = release_name(&chart.name, &operation::token(""));
        let reference = format!("{}/{}", self.repo_name, chart.name);
        let values = serde_json::to_vec(values).context("failed to encode values")?;
        info!(release = %name, chart = %reference, version = %chart.version, %namespace, "Installing");

        let out = self
            .run(
                &[
                    "install",
                    &name,
                    &reference,
                    "--version",
                    &chart.version,
                    "--namespace",
                    namespace,
                    "--create-namespace",
                    "--values",
                    "-",
                    "--wait",
                    "--output",
                    "json",
                ],
                Some(&values),
            )
            .await
            .with_context(|| format!("failed to install {} {}", chart.name, chart.version))?;

        let installed = serde_json::from_slice::<InstalledRelease>(&out)
            .context("failed to decode helm install output")?;
        let resources = manifest::resources(&installed.manifest, &installed.namespace)?;
        debug!(release = %installed.name, resources = resources.len(), "Installed");
        Ok(Release {
            name: installed.name,
            namespace: installed.namespace,
            resources,
        })
    }

    async fn undeploy(&self, release: &ReleaseRef) -> Result<()> {
        info!(release = %release.name, namespace = %release.namespace, "Uninstalling");
        let res = self
            .run(
                &[
                    "uninstall",
                    &release.name,
                    "--namespace",
                    &release.namespace,
                    "--wait",
                ],
                None,
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("release: not found") => {
                warn!(release = %release.name, "Release already uninstalled");
                Ok(())
            }
            Err(error) => Err(error.context(format!("failed to uninstall {}", release.name))),
        }
    }
}

/// Names a release after its chart with a unique suffix, within helm's length limit.
pub fn release_name(chart: &str, suffix: &str) -> String {
    let room = MAX_RELEASE_NAME.saturating_sub(suffix.len() + 1);
    let prefix = chart
        .chars()
        .take(room)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    let prefix = prefix.trim_matches('-');
    if prefix.is_empty() {
        return suffix.chars().take(MAX_RELEASE_NAME).collect();
    }
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_names() {
        assert_eq!(release_name("redis", "0a1b"), "redis-0a1b");
        assert_eq!(release_name("Mongo_DB", "0a1b"), "mongo-db-0a1b");

        let long = "a".repeat(80);
        let name = release_name(&long, &operation::token(""));
        assert_eq!(name.len(), MAX_RELEASE_NAME);
        assert!(name.starts_with("aaaa"));

        assert_eq!(release_name("--", "0a1b"), "0a1b");
    }

    #[tokio::test]
    async fn missing_binary() {
        let helm = Helm::new("/nonexistent/helm", "stable", "https://charts.example.com");
        let error = helm.init().await.expect_err("helm must not exist");
        assert!(
            error.to_string().contains("https://charts.example.com"),
            "{error:#}"
        );
    }
}
