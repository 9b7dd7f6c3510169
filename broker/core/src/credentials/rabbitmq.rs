use super::{ports, BindContext, Credentials, Provider, ProviderError};
use chart_broker_k8s_api::ResourceExt;

const PROTOCOL: &str = "amqp";
const DEFAULT_USER: &str = "user";

#[derive(Copy, Clone, Debug, Default)]
pub struct Rabbitmq;

impl Provider for Rabbitmq {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        let service = ctx.first_service()?;
        let port = ports(service)
            .iter()
            .find(|port| port.name.as_deref() == Some(PROTOCOL))
            .ok_or_else(|| ProviderError::NoNamedPort {
                service: service.name_any(),
                port: PROTOCOL,
            })?
            .port;

        let user = ctx
            .param(&["rabbitmq.username"])?
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        let password = ctx.password(&["rabbitmq-password"])?;

        Credentials::new(
            PROTOCOL,
            ctx.host(service),
            port,
            Some(user),
            password,
            None,
        )
    }
}
