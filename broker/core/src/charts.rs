use crate::{
    catalog::{ChartIndex, ChartVersion},
    params::Params,
    record::ReleaseRef,
    resources::ResourceRef,
};

/// A deployed chart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// The Services and Secrets listed in the release's manifest.
    pub resources: Vec<ResourceRef>,
}

/// Lists and resolves the charts a repository offers.
#[async_trait::async_trait]
pub trait ChartRepository: Send + Sync {
    async fn charts(&self) -> anyhow::Result<ChartIndex>;

    /// Finds the chart with exactly this name and packaging version.
    async fn resolve_chart(&self, name: &str, version: &str) -> anyhow::Result<Option<ChartVersion>> {
        let mut index = self.charts().await?;
        Ok(index
            .remove(name)
            .and_then(|versions| versions.into_iter().find(|c| c.version == version)))
    }
}

/// Installs and uninstalls releases.
#[async_trait::async_trait]
pub trait ChartDeployer: Send + Sync {
    async fn deploy(
        &self,
        chart: &ChartVersion,
        namespace: &str,
        values: &Params,
    ) -> anyhow::Result<Release>;

    async fn undeploy(&self, release: &ReleaseRef) -> anyhow::Result<()>;
}

// === impl Release ===

impl Release {
    pub fn reference(&self) -> ReleaseRef {
        ReleaseRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}
