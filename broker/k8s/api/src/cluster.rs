use thiserror::Error;

/// The cluster DNS domain used when none can be discovered.
pub const DEFAULT_DOMAIN: &str = "cluster.local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("missing the search path from resolv.conf")]
    MissingSearchPath,

    #[error("missing domain starting with 'svc.' in the search path")]
    MissingServiceDomain,
}

/// Extracts the cluster domain from the contents of a pod's `resolv.conf`.
///
/// Pods are configured with a search path like
/// `ns.svc.cluster.local svc.cluster.local cluster.local`; the cluster domain is whatever follows
/// the `svc.` entry.
pub fn domain_from_resolv_conf(conf: &str) -> Result<String, DomainError> {
    // As with the resolver, the last `search` line wins.
    let search = conf
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("search") => Some(words.collect::<Vec<_>>()),
                _ => None,
            }
        })
        .last()
        .ok_or(DomainError::MissingSearchPath)?;

    search
        .into_iter()
        .find_map(|domain| domain.strip_prefix("svc."))
        .filter(|domain| !domain.is_empty())
        .map(ToString::to_string)
        .ok_or(DomainError::MissingServiceDomain)
}

/// Returns the in-cluster fully-qualified name of a service.
pub fn service_host(name: &str, namespace: &str, domain: &str) -> String {
    format!("{name}.{namespace}.svc.{domain}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_search_path() {
        let conf = "nameserver 1.2.3.4\nnameserver 4.3.2.1\n";
        assert_eq!(
            domain_from_resolv_conf(conf),
            Err(DomainError::MissingSearchPath)
        );
    }

    #[test]
    fn missing_service_domain() {
        let conf = "nameserver 1.2.3.4\n\
                    search kubecf.svc.cluster.local cluster.local\n\
                    options ndots:5\n";
        assert_eq!(
            domain_from_resolv_conf(conf),
            Err(DomainError::MissingServiceDomain)
        );
    }

    #[test]
    fn cluster_domain() {
        let conf = "nameserver 1.2.3.4\n\
                    nameserver 4.3.2.1\n\
                    search kubecf.svc.cluster.local svc.cluster.local cluster.local\n\
                    options ndots:5\n";
        assert_eq!(domain_from_resolv_conf(conf).unwrap(), "cluster.local");
    }

    #[test]
    fn custom_cluster_domain() {
        let conf = "search default.svc.k8s.example.com svc.k8s.example.com k8s.example.com\n";
        assert_eq!(domain_from_resolv_conf(conf).unwrap(), "k8s.example.com");
    }

    #[test]
    fn host() {
        assert_eq!(
            service_host("redis-master", "ns", DEFAULT_DOMAIN),
            "redis-master.ns.svc.cluster.local"
        );
    }
}
