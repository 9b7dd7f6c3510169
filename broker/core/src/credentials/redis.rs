use super::{first_port, BindContext, Credentials, Provider, ProviderError};
use chart_broker_k8s_api::Service;

const PROTOCOL: &str = "redis";
const PRIMARY_ROLE: &str = "master";

/// Connects to the primary of a primary/replica topology. Redis has no user or database.
#[derive(Copy, Clone, Debug, Default)]
pub struct Redis;

impl Provider for Redis {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        if ctx.services.is_empty() {
            return Err(ProviderError::NoServices);
        }
        let service = ctx
            .services
            .iter()
            .find(|svc| is_primary(svc))
            .ok_or(ProviderError::NoPrimaryService)?;
        let port = first_port(service)?.port;
        let password = ctx.password(&["redis-password"])?;

        Credentials::new(PROTOCOL, ctx.host(service), port, None, password, None)
    }
}

fn is_primary(service: &Service) -> bool {
    let selector = service.spec.as_ref().and_then(|spec| spec.selector.as_ref());
    let Some(selector) = selector else {
        return false;
    };
    ["role", "app.kubernetes.io/component"]
        .iter()
        .any(|key| selector.get(*key).map(String::as_str) == Some(PRIMARY_ROLE))
}
