use crate::{
    core::{self, Broker, Providers},
    helm::Helm,
    k8s::cluster,
    metrics::OsbMetrics,
    osb::{self, Osb},
    settings::Settings,
    store::{ConfigMapRecords, KubeResources},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, warn, Instrument};

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Parser)]
#[clap(name = "chart-broker", about = "An Open Service Broker that deploys Helm charts")]
pub struct Args {
    #[clap(long, default_value = "chart_broker=info,warn", env = "CHART_BROKER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8005")]
    osb_addr: SocketAddr,

    /// The chart repository that services are offered from.
    #[clap(long, default_value = "https://charts.helm.sh/stable")]
    helm_url: String,

    #[clap(long, default_value = "stable")]
    helm_repo_name: String,

    #[clap(long, default_value = "helm")]
    helm_bin: PathBuf,

    /// The namespace to install releases into when a provision request does not name one.
    #[clap(long)]
    default_namespace: Option<String>,

    /// The namespace holding instance records.
    #[clap(long, env = "CONFIG_NAMESPACE")]
    config_namespace: String,

    /// The cluster DNS domain. Read from the pod's resolv.conf when unset.
    #[clap(long)]
    cluster_domain: Option<String>,

    /// A YAML file of per-service provisioning settings.
    #[clap(long)]
    provisioning_settings: Option<PathBuf>,

    /// Only offers services that bind to normalized credentials.
    #[clap(long)]
    service_catalog_enabled_only: bool,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            osb_addr,
            helm_url,
            helm_repo_name,
            helm_bin,
            default_namespace,
            config_namespace,
            cluster_domain,
            provisioning_settings,
            service_catalog_enabled_only,
            patch_timeout_ms,
        } = self;

        let settings = match provisioning_settings {
            Some(path) => Settings::load(&path).await?,
            None => Settings::default(),
        };

        let mut prom = <Registry>::default();
        let metrics = OsbMetrics::register(prom.sub_registry_with_prefix("osb"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let cluster_domain = match cluster_domain {
            Some(domain) => domain,
            None => discover_cluster_domain().await,
        };
        info!(%cluster_domain, "Using cluster domain");

        let helm = Arc::new(Helm::new(helm_bin, helm_repo_name, helm_url));
        helm.init().await?;

        let patch_timeout = Duration::from_millis(patch_timeout_ms);
        let records = ConfigMapRecords::new(runtime.client(), &config_namespace)
            .with_patch_timeout(patch_timeout);
        let resources = KubeResources::new(runtime.client()).with_patch_timeout(patch_timeout);
        let broker = Broker::new(
            Arc::new(records),
            Arc::new(resources),
            helm.clone(),
            helm,
            Providers::default(),
            core::Config {
                default_namespace,
                cluster_domain,
                catalog_enabled_only: service_catalog_enabled_only,
            },
        );

        let drain = runtime.shutdown_handle();
        tokio::spawn(
            osb::serve(osb_addr, Osb::new(broker, settings, metrics), async move {
                let _ = drain.signaled().await;
            })
            .instrument(info_span!("osb")),
        );

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn discover_cluster_domain() -> String {
    let domain = match tokio::fs::read_to_string(RESOLV_CONF).await {
        Ok(conf) => cluster::domain_from_resolv_conf(&conf).map_err(anyhow::Error::from),
        Err(error) => Err(error.into()),
    };
    domain.unwrap_or_else(|error| {
        warn!(%error, default = %cluster::DEFAULT_DOMAIN, "Could not discover cluster domain");
        cluster::DEFAULT_DOMAIN.to_string()
    })
}
